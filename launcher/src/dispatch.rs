use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use utils::HandoffMessage;

use crate::args::extract_protocol_url;
use crate::meeting_url::{MeetingTarget, RejectionReason, UrlParser};

/// The window layer. It only ever receives owned, already validated values.
pub trait MeetingSink: Send + Sync {
    fn open_meeting(&self, target: MeetingTarget);

    /// Someone launched the app again without a meeting URL.
    fn activate(&self) {}

    /// Whether to show this to the user is up to the sink.
    fn invalid_url(&self, _raw: &str, _reason: &RejectionReason) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Opened(MeetingTarget),
    Rejected(RejectionReason),
    Activated,
    Nothing,
}

#[derive(Default)]
struct DispatchState {
    ready: bool,
    pending: VecDeque<MeetingTarget>,
    last: Option<MeetingTarget>,
}

/// Routes protocol URLs, from this process's argv or from a secondary's
/// hand-off, to the [`MeetingSink`].
///
/// Targets dispatched before [`Dispatcher::mark_ready`] are held back and
/// delivered in order once the window layer is up.
pub struct Dispatcher {
    parser: UrlParser,
    sink: Arc<dyn MeetingSink>,
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new(parser: UrlParser, sink: Arc<dyn MeetingSink>) -> Self {
        Self {
            parser,
            sink,
            state: Mutex::new(DispatchState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn parser(&self) -> &UrlParser {
        &self.parser
    }

    /// Forward a validated target. No parsing happens here.
    pub fn dispatch(&self, target: MeetingTarget) {
        {
            let mut st = self.lock();
            st.last = Some(target.clone());
            if !st.ready {
                log::debug!("dispatch: deferred {} pending={}", target.url, st.pending.len() + 1);
                st.pending.push_back(target);
                return;
            }
        }
        log::info!("dispatch: open {}", target.url);
        self.sink.open_meeting(target);
    }

    pub fn mark_ready(&self) {
        let pending = {
            let mut st = self.lock();
            st.ready = true;
            std::mem::take(&mut st.pending)
        };
        for target in pending {
            log::info!("dispatch: open {} (deferred)", target.url);
            self.sink.open_meeting(target);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub fn last_dispatched(&self) -> Option<MeetingTarget> {
        self.lock().last.clone()
    }

    /// This process's own argv. No URL means nothing to do.
    pub fn handle_arguments(&self, args: &[String]) -> DispatchOutcome {
        match extract_protocol_url(args) {
            Some(raw) => self.open_raw(raw),
            None => DispatchOutcome::Nothing,
        }
    }

    /// A secondary's argv. No URL means the user just launched the app again.
    pub fn handle_handoff(&self, msg: HandoffMessage) -> DispatchOutcome {
        log::debug!("dispatch: handoff id={} pid={}", msg.id, msg.pid);
        match extract_protocol_url(&msg.args) {
            Some(raw) => self.open_raw(raw),
            None => {
                log::info!("dispatch: activate (handoff id={})", msg.id);
                self.sink.activate();
                DispatchOutcome::Activated
            }
        }
    }

    fn open_raw(&self, raw: &str) -> DispatchOutcome {
        match self.parser.parse(raw) {
            Ok(target) => {
                self.dispatch(target.clone());
                DispatchOutcome::Opened(target)
            }
            Err(reason) => {
                log::warn!("dispatch: rejected {:?} ({})", raw, reason);
                self.sink.invalid_url(raw, &reason);
                DispatchOutcome::Rejected(reason)
            }
        }
    }
}
