//! Detector run configuration: trigger settings, readout windows and the
//! per-module status.
use crate::detector::DomStatus;
use crate::error::{ConfigError, LookupError};
use crate::key::OmKey;
use crate::trigger::{SourceId, SubtypeId, TriggerKey, TriggerQuery, TypeId, UnknownName};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use winnow::ascii::{dec_int, float, line_ending, space0, space1, till_line_ending};
use winnow::combinator::{alt, delimited, empty, opt, preceded, separated};
use winnow::error::ContextError;
use winnow::token::{one_of, take_while};
use winnow::Parser;

/// Part of the detector a readout window applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subdetector {
    All,
    InIce,
    IceTop,
}

impl Subdetector {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Subdetector::All => "ALL",
            Subdetector::InIce => "IN_ICE",
            Subdetector::IceTop => "ICE_TOP",
        }
    }
}

impl fmt::Display for Subdetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subdetector {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALL" => Ok(Subdetector::All),
            "IN_ICE" => Ok(Subdetector::InIce),
            "ICE_TOP" => Ok(Subdetector::IceTop),
            _ => Err(UnknownName(s.to_string())),
        }
    }
}

/// How far before and after a trigger a subdetector is read out (ns).
///
/// `offset` shifts the window when the trigger came from the other
/// subdetector.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ReadoutConfig {
    pub minus: f64,
    pub plus: f64,
    pub offset: f64,
}

impl ReadoutConfig {
    pub const fn new(minus: f64, plus: f64, offset: f64) -> Self {
        Self {
            minus,
            plus,
            offset,
        }
    }
}

/// Settings and readout windows of one trigger configuration.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TriggerStatus {
    pub settings: BTreeMap<String, String>,
    pub readout: BTreeMap<Subdetector, ReadoutConfig>,
}

impl TriggerStatus {
    pub fn with_setting(mut self, name: &str, value: impl ToString) -> Self {
        self.settings.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_readout(mut self, subdetector: Subdetector, config: ReadoutConfig) -> Self {
        self.readout.insert(subdetector, config);
        self
    }
    /// Parses the setting `name`, if present.
    ///
    /// # Examples
    ///
    /// ```
    /// use trigsim::status::TriggerStatus;
    ///
    /// let status = TriggerStatus::default().with_setting("threshold", 8);
    /// assert_eq!(status.value::<u32>("threshold"), Ok(Some(8)));
    /// assert_eq!(status.value::<u32>("timeWindow"), Ok(None));
    /// assert!(status.value::<bool>("threshold").is_err());
    /// ```
    pub fn value<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        self.settings
            .get(name)
            .map(|value| {
                value.parse().map_err(|_| ConfigError::InvalidSetting {
                    name: name.to_string(),
                    value: value.clone(),
                })
            })
            .transpose()
    }
    /// Parses the setting `name`, which must be present.
    pub fn require<T: FromStr>(&self, name: &str) -> Result<T, ConfigError> {
        self.value(name)?.ok_or_else(|| ConfigError::MissingSetting {
            name: name.to_string(),
        })
    }
}

/// All trigger configurations of a run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TriggerStatusMap {
    inner: BTreeMap<TriggerKey, TriggerStatus>,
}

impl TriggerStatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: TriggerKey, status: TriggerStatus) -> Option<TriggerStatus> {
        self.inner.insert(key, status)
    }

    pub fn get(&self, key: &TriggerKey) -> Option<&TriggerStatus> {
        self.inner.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TriggerKey, &TriggerStatus)> {
        self.inner.iter()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
    /// Finds the single configuration matching `query`.
    ///
    /// # Examples
    ///
    /// ```
    /// use trigsim::error::LookupError;
    /// use trigsim::status::{TriggerStatus, TriggerStatusMap};
    /// use trigsim::trigger::{SourceId, TriggerKey, TriggerQuery, TypeId};
    ///
    /// let mut map = TriggerStatusMap::new();
    /// let smt8 = TriggerKey::new(SourceId::InIce, TypeId::SimpleMultiplicity, Some(1006));
    /// let smt3 = TriggerKey::new(SourceId::InIce, TypeId::SimpleMultiplicity, Some(1011));
    /// map.insert(smt8, TriggerStatus::default());
    /// map.insert(smt3, TriggerStatus::default());
    ///
    /// let query = TriggerQuery::builder().config_id(1006).build();
    /// assert_eq!(map.lookup(&query).map(|(key, _)| key), Ok(smt8));
    ///
    /// let query = TriggerQuery::builder().source(SourceId::InIce).build();
    /// assert!(matches!(map.lookup(&query), Err(LookupError::AmbiguousMatch { .. })));
    /// ```
    pub fn lookup(&self, query: &TriggerQuery) -> Result<(TriggerKey, &TriggerStatus), LookupError> {
        if query.is_empty() {
            return Err(LookupError::NoMatch(*query));
        }

        let mut matches = self.inner.iter().filter(|(key, _)| query.matches(key));
        match (matches.next(), matches.next()) {
            (None, _) => Err(LookupError::NoMatch(*query)),
            (Some((key, status)), None) => Ok((*key, status)),
            (Some(_), Some(_)) => Err(LookupError::AmbiguousMatch {
                query: *query,
                matches: self
                    .inner
                    .keys()
                    .filter(|key| query.matches(key))
                    .copied()
                    .collect(),
            }),
        }
    }
}

impl FromIterator<(TriggerKey, TriggerStatus)> for TriggerStatusMap {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = (TriggerKey, TriggerStatus)>,
    {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for TriggerStatusMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, status) in &self.inner {
            if !first {
                writeln!(f)?;
            }
            first = false;

            write!(f, "trigger {} {}", key.source, key.type_id)?;
            if key.subtype != SubtypeId::NoSubtype {
                write!(f, " {}", key.subtype)?;
            }
            if let Some(id) = key.config_id {
                write!(f, " {id}")?;
            }
            for (name, value) in &status.settings {
                write!(f, "\nsetting {name} {value}")?;
            }
            for (subdetector, config) in &status.readout {
                write!(
                    f,
                    "\nreadout {subdetector} {} {} {}",
                    config.minus, config.plus, config.offset
                )?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
enum Line<'i> {
    Trigger(TriggerKey),
    Setting(&'i str, &'i str),
    Readout(Subdetector, ReadoutConfig),
    Blank,
}

fn identifier<'i>(input: &mut &'i str) -> winnow::Result<&'i str> {
    (
        one_of(|c: char| c.is_ascii_alphabetic()),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

fn token<'i>(input: &mut &'i str) -> winnow::Result<&'i str> {
    take_while(1.., |c: char| !c.is_whitespace() && c != '#').parse_next(input)
}

fn trigger_line(input: &mut &str) -> winnow::Result<TriggerKey> {
    let _ = ("trigger", space1).parse_next(input)?;
    let source = identifier.try_map(SourceId::from_str).parse_next(input)?;
    let _ = space1.parse_next(input)?;
    let type_id = identifier.try_map(TypeId::from_str).parse_next(input)?;
    let subtype = opt(preceded(space1, identifier.try_map(SubtypeId::from_str)))
        .parse_next(input)?
        .unwrap_or(SubtypeId::NoSubtype);
    let config_id = opt(preceded(space1, dec_int)).parse_next(input)?;

    Ok(TriggerKey {
        source,
        type_id,
        subtype,
        config_id,
    })
}

fn setting_line<'i>(input: &mut &'i str) -> winnow::Result<(&'i str, &'i str)> {
    let _ = ("setting", space1).parse_next(input)?;
    let name = token.parse_next(input)?;
    let _ = space1.parse_next(input)?;
    let value = token.parse_next(input)?;
    Ok((name, value))
}

fn readout_line(input: &mut &str) -> winnow::Result<(Subdetector, ReadoutConfig)> {
    let _ = ("readout", space1).parse_next(input)?;
    let subdetector = identifier.try_map(Subdetector::from_str).parse_next(input)?;
    let minus = preceded(space1, float).parse_next(input)?;
    let plus = preceded(space1, float).parse_next(input)?;
    let offset = preceded(space1, float).parse_next(input)?;
    Ok((subdetector, ReadoutConfig::new(minus, plus, offset)))
}

fn line<'i>(input: &mut &'i str) -> winnow::Result<Line<'i>> {
    delimited(
        space0,
        alt((
            trigger_line.map(Line::Trigger),
            setting_line.map(|(name, value)| Line::Setting(name, value)),
            readout_line.map(|(subdetector, config)| Line::Readout(subdetector, config)),
            empty.value(Line::Blank),
        )),
        (space0, opt(('#', till_line_ending))),
    )
    .parse_next(input)
}

/// Statement that cannot be applied to the configuration read so far.
#[derive(Debug, thiserror::Error)]
enum StatementError {
    #[error("`{0}` before any `trigger` line")]
    Orphan(&'static str),
    #[error("trigger {0} defined twice")]
    Duplicate(TriggerKey),
}

#[derive(Default)]
struct MapBuilder {
    map: TriggerStatusMap,
    current: Option<TriggerKey>,
}

impl MapBuilder {
    fn apply(&mut self, line: Line<'_>) -> Result<(), StatementError> {
        match line {
            Line::Trigger(key) => {
                if self.map.inner.contains_key(&key) {
                    return Err(StatementError::Duplicate(key));
                }
                self.map.insert(key, TriggerStatus::default());
                self.current = Some(key);
            }
            Line::Setting(name, value) => {
                self.current_status("setting")?
                    .settings
                    .insert(name.to_string(), value.to_string());
            }
            Line::Readout(subdetector, config) => {
                self.current_status("readout")?
                    .readout
                    .insert(subdetector, config);
            }
            Line::Blank => {}
        }
        Ok(())
    }

    fn current_status(&mut self, statement: &'static str) -> Result<&mut TriggerStatus, StatementError> {
        self.current
            .and_then(|key| self.map.inner.get_mut(&key))
            .ok_or(StatementError::Orphan(statement))
    }
}

/// The error type returned when parsing a [`TriggerStatusMap`] fails.
#[derive(Debug)]
pub struct ParseError {
    input: String,
    span: std::ops::Range<usize>,
}

impl ParseError {
    fn from_parse(error: winnow::error::ParseError<&str, ContextError>) -> Self {
        let input = error.input().to_string();
        let span = error.char_span();
        Self { input, span }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = annotate_snippets::Level::Error
            .title("invalid trigger configuration statement")
            .snippet(
                annotate_snippets::Snippet::source(&self.input)
                    .fold(true)
                    .annotation(annotate_snippets::Level::Error.span(self.span.clone())),
            );
        let renderer = annotate_snippets::Renderer::plain();
        let rendered = renderer.render(message);
        rendered.fmt(f)
    }
}

impl std::error::Error for ParseError {}

impl FromStr for TriggerStatusMap {
    type Err = ParseError;

    /// Parses the line oriented trigger configuration format:
    ///
    /// ```text
    /// # comment
    /// trigger IN_ICE SIMPLE_MULTIPLICITY 1006
    /// setting threshold 8
    /// setting timeWindow 5000
    /// readout ALL 4000 6000 0
    /// ```
    ///
    /// `setting` and `readout` lines apply to the closest `trigger` line
    /// above them.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut builder = MapBuilder::default();

        let () = separated(0.., line.try_map(|l| builder.apply(l)), line_ending)
            .parse(input)
            .map_err(ParseError::from_parse)?;

        Ok(builder.map)
    }
}

/// Run configuration of the detector.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectorStatus {
    pub triggers: TriggerStatusMap,
    pub dom_status: BTreeMap<OmKey, DomStatus>,
}

impl DetectorStatus {
    /// Finds the single trigger configuration matching `query`.
    pub fn trigger_status(
        &self,
        query: &TriggerQuery,
    ) -> Result<(TriggerKey, &TriggerStatus), LookupError> {
        self.triggers.lookup(query)
    }
}
