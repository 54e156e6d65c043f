//! Single-letter mode sets shared by clients and channels.
//!
//! A mode set is an ordered mapping of mode letter to an optional string
//! argument. Each entity type has its own allowlist; letters outside the
//! allowlist are dropped silently. The printed `+abc-xy` form is what mode
//! change broadcasts carry on the wire.
use std::collections::BTreeMap;

/// Modes a client may carry.
pub const CLIENT_MODES: &str = "cD";
/// Valueless modes a channel may carry.
pub const CHANNEL_MODES: &str = "cDiprstz";
/// Channel modes that consume an argument when set.
pub const CHANNEL_MODES_ARG: &str = "kl";

/// Which entity a mode set belongs to, selecting the allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeTarget {
    Client,
    Channel,
}

/// An ordered set of single-letter modes with optional arguments.
#[derive(Debug, Clone)]
pub struct ModeSet {
    target: ModeTarget,
    modes: BTreeMap<char, String>,
}

impl ModeSet {
    pub fn new(target: ModeTarget) -> Self {
        Self {
            target,
            modes: BTreeMap::new(),
        }
    }

    fn allowed(&self, mode: char) -> bool {
        match self.target {
            ModeTarget::Client => CLIENT_MODES.contains(mode),
            ModeTarget::Channel => {
                CHANNEL_MODES.contains(mode) || CHANNEL_MODES_ARG.contains(mode)
            }
        }
    }

    /// Set a mode. Disallowed letters and already-set modes are ignored.
    pub fn add(&mut self, mode: char, value: &str) {
        if self.allowed(mode) && !self.has(mode) {
            self.modes.insert(mode, value.to_owned());
        }
    }

    pub fn remove(&mut self, mode: char) {
        self.modes.remove(&mode);
    }

    pub fn has(&self, mode: char) -> bool {
        self.modes.contains_key(&mode)
    }

    pub fn get(&self, mode: char) -> Option<&str> {
        self.modes.get(&mode).map(String::as_str)
    }

    /// A copy of the current mode -> argument mapping.
    pub fn snapshot(&self) -> BTreeMap<char, String> {
        self.modes.clone()
    }

    /// Apply a raw mode argument list: the first element is a letter run,
    /// subsequent elements are consumed in order by arg-taking letters.
    pub fn add_modes(&mut self, params: &[String]) {
        let Some(letters) = params.first() else {
            return;
        };

        let mut args = params.iter().skip(1);
        for mode in letters.chars() {
            if self.target == ModeTarget::Channel && CHANNEL_MODES_ARG.contains(mode) {
                let value = args.next().map(String::as_str).unwrap_or("");
                self.add(mode, value);
            } else {
                self.add(mode, "");
            }
        }
    }

    /// Remove every mode in the letter run.
    pub fn remove_modes(&mut self, letters: &str) {
        for mode in letters.chars() {
            self.remove(mode);
        }
    }

    /// Diff against an earlier snapshot: (added, removed).
    pub fn diff(
        &self,
        previous: &BTreeMap<char, String>,
    ) -> (BTreeMap<char, String>, BTreeMap<char, String>) {
        let added: BTreeMap<char, String> = self
            .modes
            .iter()
            .filter(|(mode, _)| !previous.contains_key(mode))
            .map(|(mode, value)| (*mode, value.clone()))
            .collect();

        let removed: BTreeMap<char, String> = previous
            .iter()
            .filter(|(mode, _)| !self.modes.contains_key(mode))
            .map(|(mode, value)| (*mode, value.clone()))
            .collect();

        (added, removed)
    }

    /// Canonical `+abc-xy` rendering of a mode change; at least `+`.
    pub fn print(
        added: &BTreeMap<char, String>,
        removed: &BTreeMap<char, String>,
    ) -> String {
        let mut out = String::new();

        if !added.is_empty() {
            out.push('+');
            out.extend(added.keys());
        }
        if !removed.is_empty() {
            out.push('-');
            out.extend(removed.keys());
        }

        if out.is_empty() {
            out.push('+');
        }

        out
    }

    /// Render the full current set, e.g. for RPL_CHANNELMODEIS.
    pub fn print_current(&self) -> String {
        Self::print(&self.modes, &BTreeMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_allowlist() {
        let mut modes = ModeSet::new(ModeTarget::Channel);
        modes.add_modes(&["pk".into(), "MyAwesomeChannelKey".into()]);

        let snapshot = modes.snapshot();
        assert_eq!(snapshot.get(&'p').map(String::as_str), Some(""));
        assert_eq!(
            snapshot.get(&'k').map(String::as_str),
            Some("MyAwesomeChannelKey")
        );
        assert_eq!(modes.print_current(), "+kp");
    }

    #[test]
    fn client_allowlist_drops_channel_modes() {
        let mut modes = ModeSet::new(ModeTarget::Client);
        modes.add_modes(&["ck".into(), "MyAwesomeChannelKey".into()]);

        assert!(modes.has('c'));
        assert!(!modes.has('k'));
        assert_eq!(modes.print_current(), "+c");
    }

    #[test]
    fn unknown_letters_dropped() {
        let mut modes = ModeSet::new(ModeTarget::Channel);
        modes.add_modes(&["xyc".into()]);
        assert!(!modes.has('x'));
        assert!(!modes.has('y'));
        assert!(modes.has('c'));
    }

    #[test]
    fn add_does_not_overwrite() {
        let mut modes = ModeSet::new(ModeTarget::Channel);
        modes.add('k', "first");
        modes.add('k', "second");
        assert_eq!(modes.get('k'), Some("first"));
    }

    #[test]
    fn arg_modes_consume_in_order() {
        let mut modes = ModeSet::new(ModeTarget::Channel);
        modes.add_modes(&["kl".into(), "secret".into(), "10".into()]);
        assert_eq!(modes.get('k'), Some("secret"));
        assert_eq!(modes.get('l'), Some("10"));
    }

    #[test]
    fn diff_reports_added_and_removed() {
        let mut modes = ModeSet::new(ModeTarget::Channel);
        modes.add('i', "");
        modes.add('t', "");
        let before = modes.snapshot();

        modes.remove('i');
        modes.add('s', "");

        let (added, removed) = modes.diff(&before);
        assert_eq!(added.keys().collect::<Vec<_>>(), vec![&'s']);
        assert_eq!(removed.keys().collect::<Vec<_>>(), vec![&'i']);
        assert_eq!(ModeSet::print(&added, &removed), "+s-i");
    }

    #[test]
    fn no_change_diffs_empty() {
        let mut modes = ModeSet::new(ModeTarget::Channel);
        modes.add('t', "");
        let before = modes.snapshot();

        // Re-adding a set mode and removing an unset one alters nothing.
        modes.add('t', "again");
        modes.remove('i');

        let (added, removed) = modes.diff(&before);
        assert!(added.is_empty());
        assert!(removed.is_empty());
        assert_eq!(ModeSet::print(&added, &removed), "+");
    }

    #[test]
    fn print_is_canonically_ordered() {
        let mut added = BTreeMap::new();
        added.insert('t', String::new());
        added.insert('c', String::new());
        let mut removed = BTreeMap::new();
        removed.insert('z', String::new());
        removed.insert('i', String::new());
        assert_eq!(ModeSet::print(&added, &removed), "+ct-iz");
    }

    #[test]
    fn print_roundtrips_through_add_modes() {
        let mut modes = ModeSet::new(ModeTarget::Channel);
        modes.add_modes(&["cst".into()]);
        let printed = modes.print_current();

        let mut rebuilt = ModeSet::new(ModeTarget::Channel);
        rebuilt.add_modes(&[printed.trim_start_matches('+').to_owned()]);
        assert_eq!(rebuilt.snapshot(), modes.snapshot());
    }
}
