use std::collections::BTreeMap;

use crate::error::Error;

/// Typed mount options, per the "configuration as named-bag of options"
/// redesign note: known `-o` keys get explicit fields, and anything else is
/// kept in `extra` for pass-through to the FUSE session unmodified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// Allow users other than the mounting user to access the filesystem.
    /// Requires `user_allow_other` in `/etc/fuse.conf`.
    pub allow_other: bool,
    /// Mount read-only; all write-class operations fail with `EROFS`.
    pub read_only: bool,
    /// Let the kernel perform permission checks instead of calling `access`.
    pub default_permissions: bool,
    /// Verbose per-operation tracing, independent of the process log level.
    pub debug: bool,
    /// Unrecognized `key` or `key=value` tokens, passed through verbatim.
    pub extra: BTreeMap<String, Option<String>>,
}

impl MountOptions {
    /// Parses a comma-separated `-o` argument: each token is either `key` (a
    /// bare boolean flag) or `key=value`.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let mut opts = MountOptions::default();

        if raw.trim().is_empty() {
            return Ok(opts);
        }

        for token in raw.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }

            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(v.to_string())),
                None => (token, None),
            };

            match (key, &value) {
                ("allow_other", None) => opts.allow_other = true,
                ("ro", None) | ("read_only", None) => opts.read_only = true,
                ("default_permissions", None) => opts.default_permissions = true,
                ("debug", None) => opts.debug = true,
                (known @ ("allow_other" | "ro" | "read_only" | "default_permissions" | "debug"), Some(_)) => {
                    return Err(Error::InvalidConfig(format!(
                        "option {known:?} does not take a value"
                    )))
                }
                (key, value) => {
                    opts.extra.insert(key.to_string(), value.clone());
                }
            }
        }

        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_valued_keys() {
        let opts = MountOptions::parse("allow_other,debug,custom=1").unwrap();
        assert!(opts.allow_other);
        assert!(opts.debug);
        assert!(!opts.read_only);
        assert_eq!(opts.extra.get("custom"), Some(&Some("1".to_string())));
    }

    #[test]
    fn empty_string_yields_defaults() {
        assert_eq!(MountOptions::parse("").unwrap(), MountOptions::default());
    }

    #[test]
    fn known_boolean_key_rejects_a_value() {
        assert!(MountOptions::parse("ro=true").is_err());
    }
}
