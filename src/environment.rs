use std::collections::{hash_map, HashMap};

use crate::handle::{Owned, Release};

/// A user's environment variables, keyed case-insensitively.
///
/// The original spelling of each name is preserved for iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    entries: HashMap<String, (String, String)>,
}

impl Variables {
    /// Parses a `KEY=VALUE\0...\0\0` block.
    ///
    /// Scanning stops at the first empty entry, or at the end of `units` if
    /// the block is not double-null terminated. Entries without a name
    /// (`=C:=C:\`) are skipped. A later duplicate of a name replaces the
    /// earlier one.
    pub fn parse(units: &[u16]) -> Self {
        let mut variables = Variables::default();
        for entry in units.split(|unit| *unit == 0) {
            if entry.is_empty() {
                break;
            }

            let entry = String::from_utf16_lossy(entry);
            match entry.find('=') {
                Some(sep) if sep > 0 => variables.insert(&entry[..sep], &entry[sep + 1..]),
                _ => tracing::trace!(%entry, "skipping nameless environment entry"),
            }
        }

        variables
    }

    fn insert(&mut self, name: &str, value: &str) {
        self.entries
            .insert(fold(name), (name.to_owned(), value.to_owned()));
    }

    /// Value of `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&fold(name))
            .map(|(_, value)| value.as_str())
    }

    /// Iterates `(name, value)` pairs in no particular order.
    pub fn iter(&self) -> Iter<'_> {
        Iter(self.entries.values())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Upcases one character at a time. Characters whose uppercase form is
/// longer than one character (`ß`) stay as they are, so `ß` and `SS` remain
/// distinct names.
fn fold(name: &str) -> String {
    name.chars()
        .map(|c| {
            let mut upper = c.to_uppercase();
            match (upper.next(), upper.next()) {
                (Some(single), None) => single,
                _ => c,
            }
        })
        .collect()
}

pub struct Iter<'a>(hash_map::Values<'a, String, (String, String)>);

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl<'a> IntoIterator for &'a Variables {
    type Item = (&'a str, &'a str);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Reads the variables out of a raw environment block.
///
/// The block stays pinned for the whole scan.
///
/// # Safety
///
/// `block` must be invalid or point to UTF-16 memory terminated by an empty
/// entry (two consecutive nulls).
pub unsafe fn read_variables<R: Release>(block: &Owned<R>) -> Variables {
    if block.is_invalid() {
        return Variables::default();
    }

    let pinned = block.pin();
    let start = pinned.as_ptr::<u16>();

    // Length up to, not including, the terminating empty entry.
    let mut len = 0usize;
    loop {
        if *start.add(len) == 0 && (len == 0 || *start.add(len - 1) == 0) {
            break;
        }
        len += 1;
    }

    Variables::parse(core::slice::from_raw_parts(start, len))
}

#[cfg(windows)]
pub use self::builder::*;

#[cfg(windows)]
mod builder {
    use super::{read_variables, Variables};
    use crate::{
        error::{last_error, Error, Result},
        handle::{Environment, Owned, RawHandle},
        token::{resolve_user_token, PrimaryToken, SessionSelector},
    };
    use core::ptr::null_mut;
    use windows_sys::Win32::{
        Foundation::{ERROR_INVALID_HANDLE, FALSE},
        System::Environment::CreateEnvironmentBlock,
    };

    /// An environment block built for a token, destroyed on drop.
    #[derive(Debug)]
    pub struct EnvironmentBlock(Owned<Environment>);

    impl EnvironmentBlock {
        /// Builds the environment of `token`'s user, without inheriting the
        /// caller's own variables.
        ///
        /// # Returns
        ///
        /// * `Ok(EnvironmentBlock)` - The block, owned by the caller.
        /// * `Err(Error::EnvironmentBlockFailed)` - The call failed or
        ///   produced an invalid block.
        pub fn create(token: &PrimaryToken) -> Result<Self> {
            let mut raw = null_mut();
            if unsafe { CreateEnvironmentBlock(&mut raw, token.as_raw(), FALSE) } == FALSE {
                return Err(Error::EnvironmentBlockFailed(last_error()));
            }

            let block = unsafe { checked_block(raw) }?;
            tracing::debug!(block = ?block, "created environment block");
            Ok(Self(block))
        }

        /// Parses the whole block.
        pub fn variables(&self) -> Variables {
            unsafe { read_variables(&self.0) }
        }

        /// Value of `name`, or `None` if the block does not define it.
        pub fn lookup(&self, name: &str) -> Option<String> {
            self.variables().get(name).map(str::to_owned)
        }

        /// Pointer suitable for `lpEnvironment`, valid while `self` is alive.
        pub fn as_raw(&self) -> RawHandle {
            self.0.as_raw()
        }
    }

    /// Takes ownership of `raw`; a null block is an error with a non-zero code.
    ///
    /// # Safety
    ///
    /// `raw` must be null or a block returned by `CreateEnvironmentBlock`.
    unsafe fn checked_block(raw: RawHandle) -> Result<Owned<Environment>> {
        let block: Owned<Environment> = Owned::from_raw(raw);
        if block.is_invalid() {
            return Err(Error::EnvironmentBlockFailed(ERROR_INVALID_HANDLE));
        }

        Ok(block)
    }

    /// Variables of the user logged on to `selector`.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let vars = session_environment(SessionSelector::ActiveConsole)?;
    /// println!("{:?}", vars.get("USERPROFILE"));
    /// ```
    pub fn session_environment(selector: impl Into<SessionSelector>) -> Result<Variables> {
        let token = resolve_user_token(selector, false)?;
        let block = EnvironmentBlock::create(&token)?;
        Ok(block.variables())
    }

    /// A single variable of the user logged on to `selector`.
    pub fn session_variable(selector: impl Into<SessionSelector>, name: &str) -> Result<Option<String>> {
        let token = resolve_user_token(selector, false)?;
        Ok(EnvironmentBlock::create(&token)?.lookup(name))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::tests::boxed_wide;
    use proptest::prelude::*;

    fn block(entries: &[&str]) -> Vec<u16> {
        let mut units = Vec::new();
        for entry in entries {
            units.extend(entry.encode_utf16());
            units.push(0);
        }
        units.push(0);
        units
    }

    #[test]
    fn parses_key_value_entries() {
        let vars = Variables::parse(&block(&["Path=C:\\Windows", "USERPROFILE=C:\\Users\\alice"]));
        assert_eq!(vars.len(), 2);
        assert_eq!(vars.get("USERPROFILE"), Some("C:\\Users\\alice"));
        assert_eq!(vars.get("path"), Some("C:\\Windows"));
        assert_eq!(vars.get("TEMP"), None);
    }

    #[test]
    fn values_may_contain_separators() {
        let vars = Variables::parse(&block(&["OPTS=a=b=c", "EMPTY="]));
        assert_eq!(vars.get("opts"), Some("a=b=c"));
        assert_eq!(vars.get("EMPTY"), Some(""));
    }

    #[test]
    fn nameless_and_malformed_entries_are_skipped() {
        let vars = Variables::parse(&block(&["=C:=C:\\", "NOSEPARATOR", "A=1"]));
        assert_eq!(vars.len(), 1);
        assert_eq!(vars.get("A"), Some("1"));
    }

    #[test]
    fn later_duplicate_wins() {
        let vars = Variables::parse(&block(&["Temp=first", "TEMP=second"]));
        assert_eq!(vars.len(), 1);
        assert_eq!(vars.get("temp"), Some("second"));
        assert_eq!(vars.iter().next(), Some(("TEMP", "second")));
    }

    #[test]
    fn scanning_stops_at_first_empty_entry() {
        let mut units = block(&["A=1"]);
        units.extend("B=2".encode_utf16());
        units.extend([0, 0]);

        let vars = Variables::parse(&units);
        assert_eq!(vars.get("A"), Some("1"));
        assert_eq!(vars.get("B"), None);

        let owned = boxed_wide(&units);
        let read = unsafe { read_variables(&owned) };
        assert_eq!(read, vars);
    }

    #[test]
    fn multi_char_uppercase_does_not_merge_names() {
        let vars = Variables::parse(&block(&["SS=plain", "ß=sharp", "straße=street"]));
        assert_eq!(vars.len(), 3);
        assert_eq!(vars.get("SS"), Some("plain"));
        assert_eq!(vars.get("ss"), Some("plain"));
        assert_eq!(vars.get("ß"), Some("sharp"));
        assert_eq!(vars.get("STRAßE"), Some("street"));
        assert_eq!(vars.get("STRASSE"), None);
    }

    #[test]
    fn non_ascii_names_compare_case_insensitively() {
        let vars = Variables::parse(&block(&["Ärger=1", "café=2"]));
        assert_eq!(vars.get("ärger"), Some("1"));
        assert_eq!(vars.get("CAFÉ"), Some("2"));
    }

    #[test]
    fn empty_block_has_no_variables() {
        let owned = boxed_wide(&[0, 0]);
        assert!(unsafe { read_variables(&owned) }.is_empty());
        assert!(Variables::parse(&[]).is_empty());
    }

    #[test]
    fn reads_from_owned_block() {
        let owned = boxed_wide(&block(&["SystemRoot=C:\\Windows", "USERNAME=alice"]));
        let vars = unsafe { read_variables(&owned) };
        assert_eq!(vars.get("systemroot"), Some("C:\\Windows"));
        assert_eq!(vars.get("UserName"), Some("alice"));
    }

    proptest! {
        #[test]
        fn synthesized_blocks_round_trip(
            pairs in prop::collection::hash_map("[A-Zß_][A-Z0-9_ßÄÉ]{0,12}", "[ -~]{0,24}", 0..12),
        ) {
            let entries: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
            let refs: Vec<&str> = entries.iter().map(String::as_str).collect();
            let owned = boxed_wide(&block(&refs));
            let vars = unsafe { read_variables(&owned) };

            prop_assert_eq!(vars.len(), pairs.len());
            for (key, value) in &pairs {
                prop_assert_eq!(vars.get(key), Some(value.as_str()));
                prop_assert_eq!(vars.get(&key.to_lowercase()), Some(value.as_str()));
            }
            prop_assert_eq!(vars.get("MISSING-KEY"), None);
        }
    }
}
