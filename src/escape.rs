//! Escaping of column names that collide with backend-reserved names.
//!
//! Adapters apply [`ReservedWords::escape`] to every column name they write
//! and [`ReservedWords::unescape`] to every stored name they read back, so
//! callers never see the storage spelling.
//!
//! The mapping is total and reversible: a reserved name, or any name that
//! already starts with the escape prefix, gets the prefix prepended once;
//! unescaping strips exactly one prefix. Names outside that set pass through
//! untouched.

/// A backend's reserved property names plus the prefix used to escape them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedWords {
    prefix: &'static str,
    reserved: &'static [&'static str],
}

impl ReservedWords {
    /// Creates a reserved set. `prefix` must be non-empty whenever `reserved`
    /// is non-empty.
    #[must_use]
    pub const fn new(prefix: &'static str, reserved: &'static [&'static str]) -> Self {
        Self { prefix, reserved }
    }

    /// A set with no reserved names; escaping is the identity.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            prefix: "",
            reserved: &[],
        }
    }

    #[must_use]
    pub const fn prefix(&self) -> &'static str {
        self.prefix
    }

    /// Returns true if `name` is reserved by the backend.
    #[must_use]
    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.contains(&name)
    }

    fn needs_escape(&self, name: &str) -> bool {
        !self.prefix.is_empty() && (self.is_reserved(name) || name.starts_with(self.prefix))
    }

    /// Maps an application column name to its storage name.
    #[must_use]
    pub fn escape(&self, name: &str) -> String {
        if self.needs_escape(name) {
            format!("{}{name}", self.prefix)
        } else {
            name.to_string()
        }
    }

    /// Maps a storage name back to the application column name.
    #[must_use]
    pub fn unescape(&self, stored: &str) -> String {
        if self.prefix.is_empty() {
            return stored.to_string();
        }
        stored
            .strip_prefix(self.prefix)
            .unwrap_or(stored)
            .to_string()
    }
}
