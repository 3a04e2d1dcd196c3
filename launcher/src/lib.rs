// Library half of the `jitsi-meet-launcher` binary.

pub mod args;
pub mod config;
pub mod consts;
pub mod coordinator;
pub mod dispatch;
pub mod endpoint;
pub mod meeting_url;
pub mod paths;
pub mod registration;
