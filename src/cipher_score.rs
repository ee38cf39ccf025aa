//! Cipher/digest security scoring (spec.md C3).

/// Security verdict for a cipher/digest name. Ordering matters: callers must
/// compare against the enumeration rather than relying on discriminant
/// values, since `Subpar`/`Unspec` tiers may be introduced between
/// `Blacklisted` and `Adequate` in the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verdict {
    Blacklisted,
    Subpar,
    Unspec,
    Adequate,
}

const BLACKLIST: &[&str] = &["ecb", "rc2", "rc4", "des", "des3", "md2", "md4"];

/// Score a compound cipher/digest name (OpenSSL or crypto-helper style),
/// tokenized on any of `,-.:_`. If any token matches the blacklist, the
/// verdict is [`Verdict::Blacklisted`]; otherwise [`Verdict::Adequate`].
pub fn score(name: &str) -> Verdict {
    let blacklisted = name
        .split(|c: char| ",-.:_".contains(c))
        .any(|token| BLACKLIST.contains(&token.to_ascii_lowercase().as_str()));

    if blacklisted {
        Verdict::Blacklisted
    } else {
        Verdict::Adequate
    }
}
