//! Feature flag lookups injected into services that need them

use parking_lot::RwLock;
use std::collections::HashSet;

pub trait FeatureFlags: Send + Sync {
    fn is_enabled(&self, flag: &str, account_id: &str) -> bool;
}

/// Flag set held in memory, enabled globally or per account
#[derive(Debug, Default)]
pub struct StaticFeatureFlags {
    global: RwLock<HashSet<String>>,
    per_account: RwLock<HashSet<(String, String)>>,
}

impl StaticFeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self, flag: impl Into<String>) {
        self.global.write().insert(flag.into());
    }

    pub fn enable_for_account(&self, flag: impl Into<String>, account_id: impl Into<String>) {
        self.per_account
            .write()
            .insert((flag.into(), account_id.into()));
    }

    pub fn disable(&self, flag: &str) {
        self.global.write().remove(flag);
        self.per_account.write().retain(|(f, _)| f != flag);
    }
}

impl FeatureFlags for StaticFeatureFlags {
    fn is_enabled(&self, flag: &str, account_id: &str) -> bool {
        self.global.read().contains(flag)
            || self
                .per_account
                .read()
                .contains(&(flag.to_string(), account_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_scoped_flag() {
        let flags = StaticFeatureFlags::new();
        flags.enable_for_account("MAX_QUEUE", "acct-1");
        assert!(flags.is_enabled("MAX_QUEUE", "acct-1"));
        assert!(!flags.is_enabled("MAX_QUEUE", "acct-2"));

        flags.enable("MAX_QUEUE");
        assert!(flags.is_enabled("MAX_QUEUE", "acct-2"));

        flags.disable("MAX_QUEUE");
        assert!(!flags.is_enabled("MAX_QUEUE", "acct-1"));
    }
}
