/// Controls how forgiving the spec parsers are.
///
/// Decades of hand-written package metadata produced constructs like
/// `>=3.8*` or `2023.*.*` that are formally invalid but have a clear
/// intent. Lenient parsing normalizes those; strict parsing rejects them.
/// Repodata is parsed leniently, user input strictly by default.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub enum ParseStrictness {
    /// Repair well-known malformed constructs instead of rejecting them.
    #[default]
    Lenient,

    /// Reject anything that deviates from the documented grammar.
    Strict,
}
