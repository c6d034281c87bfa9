//! Split-rule codec.
//!
//! A task carries its split/execution policy as a comma-separated list of
//! `CODE=value` tokens in a single string column, e.g. `"NF=50,UB=1"`. This
//! module parses that string into an ordered token list, answers typed
//! queries against it, and serializes it back without reordering or losing
//! tokens it does not understand. Tokens that are only read come back
//! byte-for-byte; a token is rewritten in canonical `CODE=value` form once
//! [`SplitRule::set`] replaces its value.
//!
//! A token is recognised when, after trimming surrounding whitespace, it
//! starts with a registered code, `=`, and at least one digit. The value is
//! the leading run of digits, so `NF=50x` reads as 50.
//!
//! Reads are first-match-wins. Writes through [`SplitRule::set`] never create
//! duplicates: an existing token is updated in place and any later duplicate
//! of the same code is dropped.

use std::fmt;
use std::str::FromStr;

/// Closed registry of split-rule options and their two-letter wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplitOption {
    AllowEmptyInput,
    DdmBackEnd,
    DisableAutoRetry,
    NumEventsPerInput,
    NumEventsPerWorker,
    FirstEvent,
    GroupBoundaryId,
    InstantiateTemplateAtSite,
    InstantiateTemplate,
    UseLocalIo,
    LimitedSites,
    LoadXml,
    MaxFilesPerJob,
    MergeOutput,
    NumEventsPerJob,
    NumFilesPerJob,
    NumGbPerJob,
    PfnList,
    UsePrePro,
    RegisterDatasets,
    RandomSeed,
    UseBuild,
    UseScout,
    NumEventsPerMergeJob,
    NumFilesPerMergeJob,
    NumGbPerMergeJob,
    MaxFilesPerMergeJob,
}

impl SplitOption {
    pub const ALL: &'static [SplitOption] = &[
        SplitOption::AllowEmptyInput,
        SplitOption::DdmBackEnd,
        SplitOption::DisableAutoRetry,
        SplitOption::NumEventsPerInput,
        SplitOption::NumEventsPerWorker,
        SplitOption::FirstEvent,
        SplitOption::GroupBoundaryId,
        SplitOption::InstantiateTemplateAtSite,
        SplitOption::InstantiateTemplate,
        SplitOption::UseLocalIo,
        SplitOption::LimitedSites,
        SplitOption::LoadXml,
        SplitOption::MaxFilesPerJob,
        SplitOption::MergeOutput,
        SplitOption::NumEventsPerJob,
        SplitOption::NumFilesPerJob,
        SplitOption::NumGbPerJob,
        SplitOption::PfnList,
        SplitOption::UsePrePro,
        SplitOption::RegisterDatasets,
        SplitOption::RandomSeed,
        SplitOption::UseBuild,
        SplitOption::UseScout,
        SplitOption::NumEventsPerMergeJob,
        SplitOption::NumFilesPerMergeJob,
        SplitOption::NumGbPerMergeJob,
        SplitOption::MaxFilesPerMergeJob,
    ];

    /// The two-letter code written to the wire.
    pub fn code(self) -> &'static str {
        match self {
            Self::AllowEmptyInput => "AE",
            Self::DdmBackEnd => "DE",
            Self::DisableAutoRetry => "DR",
            Self::NumEventsPerInput => "EI",
            Self::NumEventsPerWorker => "ES",
            Self::FirstEvent => "FT",
            Self::GroupBoundaryId => "GB",
            Self::InstantiateTemplateAtSite => "IA",
            Self::InstantiateTemplate => "IT",
            Self::UseLocalIo => "LI",
            Self::LimitedSites => "LS",
            Self::LoadXml => "LX",
            Self::MaxFilesPerJob => "MF",
            Self::MergeOutput => "MO",
            Self::NumEventsPerJob => "NE",
            Self::NumFilesPerJob => "NF",
            Self::NumGbPerJob => "NG",
            Self::PfnList => "PL",
            Self::UsePrePro => "PP",
            Self::RegisterDatasets => "RD",
            Self::RandomSeed => "RS",
            Self::UseBuild => "UB",
            Self::UseScout => "US",
            Self::NumEventsPerMergeJob => "ZE",
            Self::NumFilesPerMergeJob => "ZF",
            Self::NumGbPerMergeJob => "ZG",
            Self::MaxFilesPerMergeJob => "ZM",
        }
    }

    /// Look up an option by its wire code.
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|opt| opt.code() == code)
    }
}

impl fmt::Display for SplitOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Values stored under [`SplitOption::UsePrePro`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreProcessing {
    ToBeProcessed,
    Processed,
}

impl PreProcessing {
    pub fn value(self) -> u64 {
        match self {
            Self::ToBeProcessed => 1,
            Self::Processed => 2,
        }
    }

    pub fn from_value(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::ToBeProcessed),
            2 => Some(Self::Processed),
            _ => None,
        }
    }
}

/// Input/output policy derived from the group boundary id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupBoundary {
    pub id: u64,
    /// Input files may be split across jobs.
    pub input_splittable: bool,
    /// Outputs are mapped to a provenance identifier.
    pub output_mapped: bool,
}

impl GroupBoundary {
    /// Policy for a boundary id; `None` for ids outside 1..=4.
    pub fn from_id(id: u64) -> Option<Self> {
        let (input_splittable, output_mapped) = match id {
            1 => (true, false),
            2 => (true, true),
            3 => (false, false),
            4 => (false, true),
            _ => return None,
        };
        Some(Self {
            id,
            input_splittable,
            output_mapped,
        })
    }
}

/// DDM back ends addressable through [`SplitOption::DdmBackEnd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdmBackEnd {
    Rucio,
}

impl DdmBackEnd {
    pub fn value(self) -> u64 {
        match self {
            Self::Rucio => 1,
        }
    }

    pub fn from_value(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Rucio),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rucio => "rucio",
        }
    }
}

impl FromStr for DdmBackEnd {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rucio" => Ok(Self::Rucio),
            other => Err(format!("unknown DDM back end: {other}")),
        }
    }
}

/// One comma-separated token.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Known {
        opt: SplitOption,
        value: u64,
        /// Source text when it differs from `CODE=value`.
        text: Option<String>,
    },
    /// Unknown code or non-numeric value, kept verbatim.
    Raw(String),
}

impl Token {
    fn parse(raw: &str) -> Self {
        if let Some((code, value)) = raw.trim().split_once('=')
            && let Some(opt) = SplitOption::from_code(code)
            && let Some(value) = leading_number(value)
        {
            let text = (raw != canonical(opt, value)).then(|| raw.to_string());
            return Token::Known { opt, value, text };
        }
        Token::Raw(raw.to_string())
    }
}

fn canonical(opt: SplitOption, value: u64) -> String {
    format!("{}={}", opt.code(), value)
}

/// Leading ASCII digits of `s` as a number.
fn leading_number(s: &str) -> Option<u64> {
    let end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    s[..end].parse().ok()
}

/// Parsed split rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitRule {
    tokens: Vec<Token>,
}

impl SplitRule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a wire string. Never fails: malformed tokens are kept as raw text.
    pub fn parse(s: &str) -> Self {
        let tokens = if s.is_empty() {
            Vec::new()
        } else {
            s.split(',').map(Token::parse).collect()
        };
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// First value recorded for `opt`.
    pub fn get(&self, opt: SplitOption) -> Option<u64> {
        self.tokens.iter().find_map(|t| match t {
            Token::Known { opt: o, value, .. } if *o == opt => Some(*value),
            _ => None,
        })
    }

    /// Whether `opt` is present with a numeric value.
    pub fn has(&self, opt: SplitOption) -> bool {
        self.get(opt).is_some()
    }

    /// Write `opt=value`, appending when absent and updating in place otherwise.
    pub fn set(&mut self, opt: SplitOption, value: u64) {
        let mut seen = false;
        self.tokens.retain_mut(|t| match t {
            Token::Known { opt: o, value: v, text } if *o == opt => {
                if seen {
                    false
                } else {
                    if *v != value || text.is_some() {
                        *v = value;
                        *text = None;
                    }
                    seen = true;
                    true
                }
            }
            _ => true,
        });
        if !seen {
            self.tokens.push(Token::Known {
                opt,
                value,
                text: None,
            });
        }
    }

    /// Remove every occurrence of `opt`.
    pub fn unset(&mut self, opt: SplitOption) {
        self.tokens
            .retain(|t| !matches!(t, Token::Known { opt: o, .. } if *o == opt));
    }

    /// Number of tokens carrying `opt`'s code, including malformed ones.
    pub fn occurrences(&self, opt: SplitOption) -> usize {
        let prefix = format!("{}=", opt.code());
        self.tokens
            .iter()
            .filter(|t| match t {
                Token::Known { opt: o, .. } => *o == opt,
                Token::Raw(raw) => raw.trim_start().starts_with(&prefix),
            })
            .count()
    }

    pub fn pre_processing(&self) -> Option<PreProcessing> {
        self.get(SplitOption::UsePrePro)
            .and_then(PreProcessing::from_value)
    }

    pub fn group_boundary(&self) -> Option<GroupBoundary> {
        self.get(SplitOption::GroupBoundaryId)
            .and_then(GroupBoundary::from_id)
    }

    pub fn ddm_back_end(&self) -> Option<DdmBackEnd> {
        self.get(SplitOption::DdmBackEnd)
            .and_then(DdmBackEnd::from_value)
    }
}

impl FromStr for SplitRule {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for SplitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match token {
                Token::Known {
                    text: Some(text), ..
                } => f.write_str(text)?,
                Token::Known { opt, value, .. } => write!(f, "{}={}", opt.code(), value)?,
                Token::Raw(raw) => f.write_str(raw)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique_and_resolvable() {
        for opt in SplitOption::ALL {
            assert_eq!(SplitOption::from_code(opt.code()), Some(*opt));
            assert_eq!(opt.code().len(), 2);
        }
        let mut codes: Vec<_> = SplitOption::ALL.iter().map(|o| o.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), SplitOption::ALL.len());
    }

    #[test]
    fn parse_and_query() {
        let rule = SplitRule::parse("NF=50,UB=1");
        assert_eq!(rule.get(SplitOption::NumFilesPerJob), Some(50));
        assert!(rule.has(SplitOption::UseBuild));
        assert!(!rule.has(SplitOption::UseLocalIo));
    }

    #[test]
    fn empty_rule_answers_defaults() {
        let rule = SplitRule::parse("");
        assert!(rule.is_empty());
        assert_eq!(rule.get(SplitOption::NumFilesPerJob), None);
        assert!(!rule.has(SplitOption::UseBuild));
        assert_eq!(rule.to_string(), "");
    }

    #[test]
    fn set_then_get_returns_written_values() {
        let mut rule = SplitRule::new();
        rule.set(SplitOption::NumFilesPerJob, 10);
        rule.set(SplitOption::RandomSeed, 0);
        rule.set(SplitOption::GroupBoundaryId, 3);
        assert_eq!(rule.get(SplitOption::NumFilesPerJob), Some(10));
        assert_eq!(rule.get(SplitOption::RandomSeed), Some(0));
        assert_eq!(rule.get(SplitOption::GroupBoundaryId), Some(3));
        assert_eq!(rule.to_string(), "NF=10,RS=0,GB=3");
    }

    #[test]
    fn set_updates_in_place_without_duplicates() {
        let mut rule = SplitRule::parse("UB=1,NF=5,LI=1");
        rule.set(SplitOption::NumFilesPerJob, 20);
        assert_eq!(rule.to_string(), "UB=1,NF=20,LI=1");
        assert_eq!(rule.occurrences(SplitOption::NumFilesPerJob), 1);
    }

    #[test]
    fn pre_processing_marker_round_trips_as_single_token() {
        let mut rule = SplitRule::parse("NF=1");
        rule.set(SplitOption::UsePrePro, PreProcessing::ToBeProcessed.value());
        assert_eq!(rule.pre_processing(), Some(PreProcessing::ToBeProcessed));

        rule.set(SplitOption::UsePrePro, PreProcessing::Processed.value());
        assert_eq!(rule.pre_processing(), Some(PreProcessing::Processed));
        assert_eq!(rule.occurrences(SplitOption::UsePrePro), 1);
        assert_eq!(rule.to_string().matches("PP=").count(), 1);
    }

    #[test]
    fn parsed_duplicates_read_first_match() {
        let mut rule = SplitRule::parse("NF=3,UB=1,NF=7");
        assert_eq!(rule.get(SplitOption::NumFilesPerJob), Some(3));
        assert_eq!(rule.to_string(), "NF=3,UB=1,NF=7");

        rule.set(SplitOption::NumFilesPerJob, 9);
        assert_eq!(rule.to_string(), "NF=9,UB=1");
    }

    #[test]
    fn malformed_and_unknown_tokens_are_preserved() {
        let rule = SplitRule::parse("NF=abc,QQ=4,UB=1,LI=");
        assert_eq!(rule.get(SplitOption::NumFilesPerJob), None);
        assert!(!rule.has(SplitOption::NumFilesPerJob));
        assert!(!rule.has(SplitOption::UseLocalIo));
        assert!(rule.has(SplitOption::UseBuild));
        assert_eq!(rule.to_string(), "NF=abc,QQ=4,UB=1,LI=");
        assert_eq!(rule.occurrences(SplitOption::NumFilesPerJob), 1);
    }

    #[test]
    fn non_canonical_values_are_written_back_verbatim() {
        let rule = SplitRule::parse("NF=05,UB=1");
        assert_eq!(rule.get(SplitOption::NumFilesPerJob), Some(5));
        assert_eq!(rule.to_string(), "NF=05,UB=1");

        let mut rule = SplitRule::parse("NF=05,UB=1");
        rule.set(SplitOption::NumFilesPerJob, 6);
        assert_eq!(rule.to_string(), "NF=6,UB=1");
    }

    #[test]
    fn setting_the_read_value_keeps_the_rule_unchanged() {
        let before = SplitRule::parse("NF=5,UB=1");
        let mut rule = before.clone();
        rule.set(SplitOption::NumFilesPerJob, 5);
        assert_eq!(rule, before);
    }

    #[test]
    fn whitespace_and_trailing_text_around_values() {
        let rule = SplitRule::parse("NF=50, UB=1");
        assert!(rule.has(SplitOption::UseBuild));
        assert_eq!(rule.to_string(), "NF=50, UB=1");

        let rule = SplitRule::parse("NF=50x");
        assert_eq!(rule.get(SplitOption::NumFilesPerJob), Some(50));
        assert_eq!(rule.to_string(), "NF=50x");

        let rule = SplitRule::parse("NF= 5");
        assert_eq!(rule.get(SplitOption::NumFilesPerJob), None);
    }

    #[test]
    fn codes_only_match_whole_tokens() {
        let rule = SplitRule::parse("XNF=4");
        assert_eq!(rule.get(SplitOption::NumFilesPerJob), None);
    }

    #[test]
    fn unset_removes_all_occurrences() {
        let mut rule = SplitRule::parse("LS=1,NF=2,LS=1");
        rule.unset(SplitOption::LimitedSites);
        assert_eq!(rule.to_string(), "NF=2");
    }

    #[test]
    fn group_boundary_policy() {
        let one = GroupBoundary::from_id(1).unwrap();
        assert!(one.input_splittable);
        assert!(!one.output_mapped);

        let two = GroupBoundary::from_id(2).unwrap();
        assert!(two.input_splittable && two.output_mapped);

        let three = GroupBoundary::from_id(3).unwrap();
        assert!(!three.input_splittable && !three.output_mapped);

        let four = GroupBoundary::from_id(4).unwrap();
        assert!(!four.input_splittable);
        assert!(four.output_mapped);

        assert!(GroupBoundary::from_id(0).is_none());
        assert!(GroupBoundary::from_id(5).is_none());
    }

    #[test]
    fn ddm_back_end_value() {
        let mut rule = SplitRule::new();
        rule.set(SplitOption::DdmBackEnd, DdmBackEnd::Rucio.value());
        assert_eq!(rule.ddm_back_end(), Some(DdmBackEnd::Rucio));
        assert_eq!("rucio".parse::<DdmBackEnd>(), Ok(DdmBackEnd::Rucio));
        assert!("dq2".parse::<DdmBackEnd>().is_err());
    }
}
