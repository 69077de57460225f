//! Token count estimation
//!
//! The upstream never reports usage, so counts are estimated at roughly
//! four characters per token.

/// Estimate tokens for a piece of text: `ceil(chars / 4)`
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    chars.div_ceil(4) as u32
}

/// Estimate tokens across several texts, counting characters jointly
pub fn estimate_total<'a, I>(texts: I) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    let chars: usize = texts.into_iter().map(|t| t.chars().count()).sum();
    chars.div_ceil(4) as u32
}
