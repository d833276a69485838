//! Access policy: who may chat with the agent.

use crate::agent::settings::Config;

/// Whether `address` may use the chat service under `config`.
///
/// The deny list wins over the allow list. The allow list is strict: an
/// address matching neither list is refused. Entries are full addresses or
/// `@domain` suffixes, compared case-insensitively.
pub fn permitted(address: &str, config: &Config) -> bool {
    let address = address.trim();
    let domain = match address.find('@') {
        Some(at) if at > 0 => &address[at..],
        // No local part, or no `@` at all.
        _ => return false,
    };

    if listed(&config.deny_list, address, domain) {
        return false;
    }
    listed(&config.allow_list, address, domain)
}

fn listed(list: &[String], address: &str, domain: &str) -> bool {
    list.iter()
        .any(|entry| entry.eq_ignore_ascii_case(address) || entry.eq_ignore_ascii_case(domain))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(allow: &[&str], deny: &[&str]) -> Config {
        Config {
            allow_list: allow.iter().map(|s| s.to_string()).collect(),
            deny_list: deny.iter().map(|s| s.to_string()).collect(),
            ..Config::default()
        }
    }

    #[test]
    fn empty_lists_deny_everyone() {
        assert!(!permitted("alice@example.com", &Config::default()));
    }

    #[test]
    fn exact_address_is_allowed() {
        let cfg = config(&["alice@example.com"], &[]);
        assert!(permitted("alice@example.com", &cfg));
        assert!(permitted("Alice@Example.COM", &cfg));
        assert!(!permitted("bob@example.com", &cfg));
    }

    #[test]
    fn domain_entry_allows_whole_domain() {
        let cfg = config(&["@example.com"], &[]);
        assert!(permitted("alice@example.com", &cfg));
        assert!(permitted("bob@example.com", &cfg));
        assert!(!permitted("alice@example.org", &cfg));
        assert!(!permitted("alice@sub.example.com", &cfg));
    }

    #[test]
    fn deny_beats_allow() {
        let allow = ["@example.com", "alice@example.com", "eve@evil.io", "@evil.io"];
        let deny_sets: [&[&str]; 2] = [&["eve@evil.io", "alice@example.com"], &["@evil.io", "@example.com"]];
        for deny in deny_sets {
            let cfg = config(&allow, deny);
            assert!(!permitted("alice@example.com", &cfg));
            assert!(!permitted("eve@evil.io", &cfg));
        }
    }

    #[test]
    fn deny_by_domain_covers_every_address() {
        let cfg = config(&["@corp.io"], &["@corp.io"]);
        for user in ["a", "b.c", "first+tag"] {
            assert!(!permitted(&format!("{user}@corp.io"), &cfg));
        }
    }

    #[test]
    fn unlisted_addresses_are_denied() {
        let cfg = config(&["@corp.io", "vip@gmail.com"], &["@spam.com"]);
        for addr in ["x@gmail.com", "y@corp.org", "z@other.net", "vip@gmail.co"] {
            assert!(!permitted(addr, &cfg), "{addr} should be denied");
        }
    }

    #[test]
    fn malformed_addresses_are_denied() {
        let cfg = config(&["@example.com"], &[]);
        assert!(!permitted("@example.com", &cfg));
        assert!(!permitted("example.com", &cfg));
        assert!(!permitted("", &cfg));
    }

    #[test]
    fn domain_is_taken_after_first_at() {
        let cfg = config(&["@b@example.com"], &[]);
        assert!(permitted("a@b@example.com", &cfg));
    }
}
