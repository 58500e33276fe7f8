use proptest::prelude::*;

use portnote::targets::{build, is_ip_literal, normalize};

#[tokio::test]
async fn test_literal_ip_targets() {
    assert_eq!(build("127.0.0.1").await.unwrap(), vec!["127.0.0.1"]);
    assert_eq!(build("http://[::1]:8080/").await.unwrap(), vec!["::1"]);
    assert!(build("   ").await.is_err());
}

#[tokio::test]
async fn test_localhost_resolves_after_name() {
    let targets = build("LOCALHOST:22").await.unwrap();
    assert_eq!(targets[0], "localhost");
    assert!(targets.iter().skip(1).all(|t| is_ip_literal(t)));
}

proptest! {
    #[test]
    fn normalize_is_idempotent(input in "[a-zA-Z0-9:/@.\\[\\] ?#-]{0,40}") {
        if let Some(first) = normalize(&input) {
            prop_assert_eq!(normalize(&first), Some(first.clone()));
        }
    }

    #[test]
    fn normalize_output_is_lowercase_and_trimmed(input in "[ -~]{0,40}") {
        if let Some(out) = normalize(&input) {
            prop_assert!(!out.is_empty());
            prop_assert_eq!(out.clone(), out.to_lowercase());
            prop_assert_eq!(out.trim(), out.as_str());
        }
    }

    #[test]
    fn normalize_strips_url_decoration(
        host in "[a-z][a-z0-9-]{0,20}(\\.[a-z]{2,6}){1,2}",
        port in 1u16..,
        path in "[a-z0-9/]{0,10}",
    ) {
        let url = format!("https://user:secret@{}:{}/{}", host.to_uppercase(), port, path);
        prop_assert_eq!(normalize(&url), Some(host));
    }

    #[test]
    fn bare_ipv6_is_kept(segments in proptest::collection::vec(0u16..=0xffff, 8)) {
        let addr = segments
            .iter()
            .map(|s| format!("{:x}", s))
            .collect::<Vec<_>>()
            .join(":");
        prop_assert_eq!(normalize(&addr), Some(addr.clone()));
        prop_assert_eq!(normalize(&format!("[{}]:443", addr)), Some(addr));
    }
}
