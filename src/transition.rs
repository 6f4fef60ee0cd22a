//! Page-transition descriptor: a core navigation kind in the low bits plus
//! qualifier flags in the high bits.
//!
//! Redirect chains are encoded with the chain-start/chain-end bits here and
//! the `referring_visit` link on the visit row; there is no separate chain
//! table.

use bitflags::bitflags;

/// What kind of navigation produced a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoreTransition {
    #[default]
    Link = 0,
    Typed = 1,
    AutoBookmark = 2,
    AutoSubframe = 3,
    ManualSubframe = 4,
    Generated = 5,
    AutoToplevel = 6,
    FormSubmit = 7,
    Reload = 8,
    Keyword = 9,
    /// Synthetic visit to the keyword's host, duplicating the real search
    /// navigation so omnibox autocompletion learns the host.
    KeywordGenerated = 10,
}

impl CoreTransition {
    fn from_bits(v: u32) -> Self {
        match v {
            1 => CoreTransition::Typed,
            2 => CoreTransition::AutoBookmark,
            3 => CoreTransition::AutoSubframe,
            4 => CoreTransition::ManualSubframe,
            5 => CoreTransition::Generated,
            6 => CoreTransition::AutoToplevel,
            7 => CoreTransition::FormSubmit,
            8 => CoreTransition::Reload,
            9 => CoreTransition::Keyword,
            10 => CoreTransition::KeywordGenerated,
            _ => CoreTransition::Link,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Qualifiers: u32 {
        /// Navigation used the back or forward button.
        const FORWARD_BACK = 0x0100_0000;
        const FROM_ADDRESS_BAR = 0x0200_0000;
        /// First visit of a redirect chain.
        const CHAIN_START = 0x1000_0000;
        /// Last visit of a redirect chain (possibly the same visit).
        const CHAIN_END = 0x2000_0000;
        const CLIENT_REDIRECT = 0x4000_0000;
        const SERVER_REDIRECT = 0x8000_0000;
    }
}

impl Qualifiers {
    pub const REDIRECT_MASK: Qualifiers =
        Qualifiers::CLIENT_REDIRECT.union(Qualifiers::SERVER_REDIRECT);
}

const CORE_MASK: u32 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTransition {
    core: CoreTransition,
    qualifiers: Qualifiers,
}

impl PageTransition {
    pub fn new(core: CoreTransition) -> Self {
        PageTransition { core, qualifiers: Qualifiers::empty() }
    }

    pub fn with(core: CoreTransition, qualifiers: Qualifiers) -> Self {
        PageTransition { core, qualifiers }
    }

    pub fn core(self) -> CoreTransition {
        self.core
    }

    pub fn qualifiers(self) -> Qualifiers {
        self.qualifiers
    }

    pub fn has(self, q: Qualifiers) -> bool {
        self.qualifiers.intersects(q)
    }

    #[must_use]
    pub fn union(self, q: Qualifiers) -> Self {
        PageTransition { core: self.core, qualifiers: self.qualifiers | q }
    }

    #[must_use]
    pub fn without(self, q: Qualifiers) -> Self {
        PageTransition { core: self.core, qualifiers: self.qualifiers - q }
    }

    /// Keep the core and qualifiers, replacing only the core type. Used by
    /// the untyped-intranet-host upgrade.
    #[must_use]
    pub fn with_core(self, core: CoreTransition) -> Self {
        PageTransition { core, qualifiers: self.qualifiers }
    }

    pub fn core_type_is(self, core: CoreTransition) -> bool {
        self.core == core
    }

    pub fn is_main_frame(self) -> bool {
        !matches!(self.core, CoreTransition::AutoSubframe | CoreTransition::ManualSubframe)
    }

    pub fn is_redirect(self) -> bool {
        self.qualifiers.intersects(Qualifiers::REDIRECT_MASK)
    }

    /// A navigation the user actively performed, as opposed to a reload or a
    /// back/forward traversal of an existing entry.
    pub fn is_new_navigation(self) -> bool {
        self.core != CoreTransition::Reload && !self.qualifiers.contains(Qualifiers::FORWARD_BACK)
    }

    /// Whether a visit with this transition bumps the URL's typed count.
    pub fn is_typed_increment(self) -> bool {
        self.is_new_navigation()
            && ((self.core == CoreTransition::Typed && !self.is_redirect())
                || self.core == CoreTransition::KeywordGenerated)
    }

    pub fn as_i64(self) -> i64 {
        (self.core as u32 | self.qualifiers.bits()) as i64
    }

    pub fn from_i64(v: i64) -> Self {
        let v = v as u32;
        PageTransition {
            core: CoreTransition::from_bits(v & CORE_MASK),
            qualifiers: Qualifiers::from_bits_truncate(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_i64() {
        let t = PageTransition::with(
            CoreTransition::Typed,
            Qualifiers::CHAIN_START | Qualifiers::CHAIN_END,
        );
        assert_eq!(PageTransition::from_i64(t.as_i64()), t);
    }

    #[test]
    fn test_typed_increment_rule() {
        let typed = PageTransition::new(CoreTransition::Typed);
        assert!(typed.is_typed_increment());

        // A redirected typed navigation does not count.
        assert!(!typed.union(Qualifiers::SERVER_REDIRECT).is_typed_increment());

        // Back/forward reuses the transition but is not a new navigation.
        assert!(!typed.union(Qualifiers::FORWARD_BACK).is_typed_increment());

        assert!(PageTransition::new(CoreTransition::KeywordGenerated).is_typed_increment());
        assert!(!PageTransition::new(CoreTransition::Link).is_typed_increment());
        assert!(!PageTransition::new(CoreTransition::Reload).is_typed_increment());
    }

    #[test]
    fn test_frame_and_chain_predicates() {
        let sub = PageTransition::new(CoreTransition::AutoSubframe);
        assert!(!sub.is_main_frame());

        let mid = PageTransition::with(CoreTransition::Typed, Qualifiers::SERVER_REDIRECT);
        assert!(mid.is_redirect());
        assert!(!mid.has(Qualifiers::CHAIN_START));
        assert!(!mid.has(Qualifiers::CHAIN_END));

        let cleared = mid.union(Qualifiers::CHAIN_END).without(Qualifiers::CHAIN_END);
        assert!(!cleared.has(Qualifiers::CHAIN_END));
    }
}
