//! Trigger records and the algorithms that produce them.
use crate::detector::Geometry;
use crate::domset::DomSets;
use crate::launch::LaunchMap;
use std::fmt;
use std::str::FromStr;

/// Spatial clustering of hits along a string.
pub mod cluster;
/// Volume (cylinder) multiplicity.
pub mod cylinder;
/// Readout windows and the merging of triggers into a global hierarchy.
pub mod global;
/// Arena-backed tree of triggers.
pub mod hierarchy;
/// Slow particle (monopole) trigger.
pub mod slow_monopole;
/// Simple majority (multiplicity) trigger.
pub mod smt;
/// Per-string multiplicity with a depth veto.
pub mod string;

/// The error returned when a name does not correspond to any identifier.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown identifier `{0}`")]
pub struct UnknownName(pub String);

macro_rules! named_ids {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal,)+ }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownName;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownName(s.to_string())),
                }
            }
        }
    };
}

named_ids! {
    /// Subsystem that issued a trigger.
    SourceId {
        InIce => "IN_ICE",
        IceTop => "ICE_TOP",
        AmandaTwrDaq => "AMANDA_TWR_DAQ",
        External => "EXTERNAL",
        Global => "GLOBAL",
        AmandaMuonDaq => "AMANDA_MUON_DAQ",
        Spase => "SPASE",
        UnknownSource => "UNKNOWN_SOURCE",
    }
}

named_ids! {
    /// Algorithm family of a trigger.
    TypeId {
        SimpleMultiplicity => "SIMPLE_MULTIPLICITY",
        Calibration => "CALIBRATION",
        MinBias => "MIN_BIAS",
        Throughput => "THROUGHPUT",
        TwoCoincidence => "TWO_COINCIDENCE",
        ThreeCoincidence => "THREE_COINCIDENCE",
        Merged => "MERGED",
        SlowParticle => "SLOW_PARTICLE",
        FragmentMultiplicity => "FRAGMENT_MULTIPLICITY",
        String => "STRING",
        Volume => "VOLUME",
        Sphere => "SPHERE",
        Unbiased => "UNBIASED",
        Spase2 => "SPASE_2",
        UnknownType => "UNKNOWN_TYPE",
    }
}

named_ids! {
    SubtypeId {
        NoSubtype => "NO_SUBTYPE",
        M18 => "M18",
        M24 => "M24",
        T0 => "T0",
        Laser => "LASER",
        UnknownSubtype => "UNKNOWN_SUBTYPE",
    }
}

/// Identifies a trigger configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TriggerKey {
    pub source: SourceId,
    pub type_id: TypeId,
    pub subtype: SubtypeId,
    pub config_id: Option<i32>,
}

impl TriggerKey {
    pub const fn new(source: SourceId, type_id: TypeId, config_id: Option<i32>) -> Self {
        Self {
            source,
            type_id,
            subtype: SubtypeId::NoSubtype,
            config_id,
        }
    }

    pub const fn with_subtype(mut self, subtype: SubtypeId) -> Self {
        self.subtype = subtype;
        self
    }
}

impl Default for TriggerKey {
    fn default() -> Self {
        Self::new(SourceId::UnknownSource, TypeId::UnknownType, None)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}", self.source, self.type_id)?;
        if self.subtype != SubtypeId::NoSubtype {
            write!(f, " {}", self.subtype)?;
        }
        if let Some(id) = self.config_id {
            write!(f, " {id}")?;
        }
        write!(f, "]")
    }
}

/// A trigger decision spanning `[time, time + length]` (ns).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Trigger {
    pub key: TriggerKey,
    pub fired: bool,
    pub time: f64,
    pub length: f64,
}

impl Trigger {
    pub fn new(key: TriggerKey, time: f64, length: f64) -> Self {
        Self {
            key,
            fired: true,
            time,
            length,
        }
    }

    pub fn end(&self) -> f64 {
        self.time + self.length
    }
}

/// Partial description of a trigger configuration. Unset fields match any
/// value.
///
/// # Examples
///
/// ```
/// use trigsim::trigger::{SourceId, TriggerKey, TriggerQuery, TypeId};
///
/// let query = TriggerQuery::builder().source(SourceId::InIce).build();
/// let key = TriggerKey::new(SourceId::InIce, TypeId::Volume, Some(21000));
/// assert!(query.matches(&key));
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, bon::Builder)]
pub struct TriggerQuery {
    pub source: Option<SourceId>,
    pub type_id: Option<TypeId>,
    pub subtype: Option<SubtypeId>,
    pub config_id: Option<i32>,
}

impl TriggerQuery {
    pub fn is_empty(&self) -> bool {
        self.source.is_none()
            && self.type_id.is_none()
            && self.subtype.is_none()
            && self.config_id.is_none()
    }
    /// Returns `true` if every field set in the query equals the key's.
    pub fn matches(&self, key: &TriggerKey) -> bool {
        self.source.is_none_or(|s| s == key.source)
            && self.type_id.is_none_or(|t| t == key.type_id)
            && self.subtype.is_none_or(|s| s == key.subtype)
            && self.config_id.is_none_or(|c| key.config_id == Some(c))
    }
}

impl fmt::Display for TriggerQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn field<T: fmt::Display>(value: &Option<T>) -> String {
            value.as_ref().map_or_else(|| "*".to_string(), T::to_string)
        }
        write!(
            f,
            "query [{} {} {} {}]",
            field(&self.source),
            field(&self.type_id),
            field(&self.subtype),
            field(&self.config_id)
        )
    }
}

/// Inputs other than launches that algorithms may consult.
#[derive(Clone, Copy, Debug)]
pub struct TriggerContext<'a> {
    pub geometry: &'a Geometry,
    pub dom_sets: Option<&'a DomSets>,
}

/// Interface shared by every trigger algorithm.
pub trait TriggerAlgorithm {
    /// Key attached to the triggers this algorithm emits.
    fn key(&self) -> TriggerKey;
    /// Runs the algorithm over the launches of one event.
    fn run(&mut self, launches: &LaunchMap, context: &TriggerContext<'_>) -> Vec<Trigger>;
}
