//! Fallback Chains
//!
//! Ordered lists of named resolvers tried in sequence. The first resolver
//! returning `Some` wins, and its name is kept so logs can say where a
//! value came from.

/// A single resolver over a context `C`
pub type Resolver<C, T> = fn(&C) -> Option<T>;

/// Ordered resolver list
pub struct ResolverChain<C, T> {
    steps: Vec<(&'static str, Resolver<C, T>)>,
}

impl<C, T> Default for ResolverChain<C, T> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<C, T> ResolverChain<C, T> {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn then(mut self, name: &'static str, resolver: Resolver<C, T>) -> Self {
        self.steps.push((name, resolver));
        self
    }

    /// Resolve, returning the winning step name alongside the value.
    pub fn resolve_named(&self, ctx: &C) -> Option<(&'static str, T)> {
        self.steps
            .iter()
            .find_map(|(name, step)| step(ctx).map(|value| (*name, value)))
    }

    pub fn resolve(&self, ctx: &C) -> Option<T> {
        self.resolve_named(ctx).map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Trimmed non-empty copy of an optional string.
pub fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// First non-empty candidate.
pub fn first_non_empty<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Option<String> {
    candidates.into_iter().find_map(non_empty)
}

/// Normalize an email for comparisons and hashing.
pub fn normalize_email(email: &str) -> Option<String> {
    let trimmed = email.trim().to_lowercase();
    (!trimmed.is_empty() && trimmed.contains('@')).then_some(trimmed)
}
