use crate::meeting_url::looks_like_protocol_url;

/// Pick the candidate protocol URL out of a raw argument vector.
///
/// `args` is a full argv as produced by `std::env::args()`, so `args[0]` (the
/// program) is skipped. The first `-u/--url` value or the first positional
/// argument shaped like `jitsi-meet://...` wins, whichever comes first. An
/// explicit `--url` value is returned as given and left to the parser to reject.
pub fn extract_protocol_url(args: &[String]) -> Option<&str> {
    let mut it = args.iter().skip(1);
    while let Some(a) = it.next() {
        if a == "-u" || a == "--url" {
            return it.next().map(String::as_str);
        }
        if let Some(v) = a.strip_prefix("--url=") {
            return Some(v);
        }
        if looks_like_protocol_url(a) {
            return Some(a.as_str());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn positional_protocol_url_is_found() {
        let a = argv(&["app", "--verbose", "jitsi-meet://room", "jitsi-meet://other"]);
        assert_eq!(extract_protocol_url(&a), Some("jitsi-meet://room"));
    }

    #[test]
    fn url_option_forms() {
        assert_eq!(
            extract_protocol_url(&argv(&["app", "--url", "jitsi-meet://a"])),
            Some("jitsi-meet://a")
        );
        assert_eq!(
            extract_protocol_url(&argv(&["app", "-u", "https://meet.jit.si/a"])),
            Some("https://meet.jit.si/a")
        );
        assert_eq!(
            extract_protocol_url(&argv(&["app", "--url=jitsi-meet://b"])),
            Some("jitsi-meet://b")
        );
        assert_eq!(extract_protocol_url(&argv(&["app", "--url"])), None);
    }

    #[test]
    fn flags_and_program_name_are_never_urls() {
        assert_eq!(extract_protocol_url(&argv(&["app", "--help", "-h", "--version"])), None);
        assert_eq!(extract_protocol_url(&argv(&["jitsi-meet://looks-like-a-url"])), None);
        assert_eq!(extract_protocol_url(&[]), None);
    }

    #[test]
    fn bare_scheme_is_still_a_candidate() {
        // Extraction is shape-only; the parser reports EmptyPayload.
        assert_eq!(
            extract_protocol_url(&argv(&["app", "jitsi-meet://"])),
            Some("jitsi-meet://")
        );
    }
}
