//! Parameter cache and the device command vocabulary.
//!
//! Every `+key value` feedback line updates the cache. Issuing a command
//! invalidates the command's own key plus whatever keys the verb is known to
//! make stale, as listed in [`Verb::invalidates`].

use std::collections::BTreeMap;
use std::fmt;

/// Last value the device reported for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    /// Numeric value
    Int(i64),
    /// Anything that does not parse as an integer
    Text(String),
}

impl ParamValue {
    /// Integer when the token parses as one, text otherwise.
    pub fn parse(token: &str) -> Self {
        match token.parse::<i64>() {
            Ok(value) => ParamValue::Int(value),
            Err(_) => ParamValue::Text(token.to_string()),
        }
    }

    /// The value as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(value) => Some(*value),
            ParamValue::Text(_) => None,
        }
    }

    /// The value as text, if it is not an integer.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(text) => Some(text),
            ParamValue::Int(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(value) => write!(f, "{}", value),
            ParamValue::Text(text) => f.write_str(text),
        }
    }
}

/// Commands understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Sampling rate in Hz
    Rate,
    /// Analog input channel mask
    AiMask,
    /// Digital input line mask
    DiMask,
    /// Start without waiting for a trigger
    Immediate,
    /// Start on an edge of a digital line
    Trigger,
    /// Scans per input chunk
    NScans,
    /// Chunks per episode
    NChunks,
    /// Episode period
    Period,
    /// Episode count
    NEpis,
    /// Begin acquisition
    Start,
    /// End acquisition
    Stop,
    /// Do nothing; flushes feedback
    Nop,
    /// Check the parameter set
    Verify,
    /// Device identity
    Identify,
    /// Device capabilities
    Info,
    /// Input calibration
    ISlope,
    /// Output calibration
    OSlope,
    /// Upload a wave table
    Wave,
    /// Configure sampled output
    Sampled,
    /// Upload sampled output data
    Data,
}

const PARAMETER_CHANGE: &[&str] = &["verify"];
const START_EFFECTS: &[&str] = &["stop"];

impl Verb {
    /// Look up a verb by its wire spelling.
    pub fn from_token(token: &str) -> Option<Self> {
        let verb = match token {
            "rate" => Verb::Rate,
            "aimask" => Verb::AiMask,
            "dimask" => Verb::DiMask,
            "immediate" => Verb::Immediate,
            "trigger" => Verb::Trigger,
            "nscans" => Verb::NScans,
            "nchunks" => Verb::NChunks,
            "period" => Verb::Period,
            "nepis" => Verb::NEpis,
            "start" => Verb::Start,
            "stop" => Verb::Stop,
            "nop" => Verb::Nop,
            "verify" => Verb::Verify,
            "picodaq" => Verb::Identify,
            "info" => Verb::Info,
            "islope" => Verb::ISlope,
            "oslope" => Verb::OSlope,
            "wave" => Verb::Wave,
            "sampled" => Verb::Sampled,
            "data" => Verb::Data,
            _ => return None,
        };
        Some(verb)
    }

    /// Wire spelling, which is also the cache key of the verb's own reply.
    pub fn token(self) -> &'static str {
        match self {
            Verb::Rate => "rate",
            Verb::AiMask => "aimask",
            Verb::DiMask => "dimask",
            Verb::Immediate => "immediate",
            Verb::Trigger => "trigger",
            Verb::NScans => "nscans",
            Verb::NChunks => "nchunks",
            Verb::Period => "period",
            Verb::NEpis => "nepis",
            Verb::Start => "start",
            Verb::Stop => "stop",
            Verb::Nop => "nop",
            Verb::Verify => "verify",
            Verb::Identify => "picodaq",
            Verb::Info => "info",
            Verb::ISlope => "islope",
            Verb::OSlope => "oslope",
            Verb::Wave => "wave",
            Verb::Sampled => "sampled",
            Verb::Data => "data",
        }
    }

    /// Cache keys made stale by issuing this verb, besides its own.
    pub fn invalidates(self) -> &'static [&'static str] {
        match self {
            Verb::Rate
            | Verb::AiMask
            | Verb::DiMask
            | Verb::Immediate
            | Verb::Trigger
            | Verb::NScans
            | Verb::NChunks
            | Verb::Period
            | Verb::NEpis
            | Verb::Sampled => PARAMETER_CHANGE,
            Verb::Start => START_EFFECTS,
            Verb::Stop
            | Verb::Nop
            | Verb::Verify
            | Verb::Identify
            | Verb::Info
            | Verb::ISlope
            | Verb::OSlope
            | Verb::Wave
            | Verb::Data => &[],
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Last-known device parameters, keyed by feedback key.
#[derive(Debug, Clone, Default)]
pub struct ParamCache {
    values: BTreeMap<String, ParamValue>,
}

impl ParamCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value for `key`.
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    /// Cached value for `key`, if it is an integer.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(ParamValue::as_int)
    }

    /// Whether `key` has a cached value.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Store a value for `key`, replacing any earlier one.
    pub fn insert(&mut self, key: impl Into<String>, value: ParamValue) {
        self.values.insert(key.into(), value);
    }

    /// Forget `key`.
    pub fn remove(&mut self, key: &str) -> Option<ParamValue> {
        self.values.remove(key)
    }

    /// Whether `key` holds the text `expected`.
    pub fn is_text(&self, key: &str, expected: &str) -> bool {
        self.get(key).and_then(ParamValue::as_text) == Some(expected)
    }

    /// Drop the entries made stale by issuing `token`.
    ///
    /// Unknown verbs only lose their own key.
    pub fn invalidate_for(&mut self, token: &str) {
        self.values.remove(token);
        if let Some(verb) = Verb::from_token(token) {
            for key in verb.invalidates() {
                self.values.remove(*key);
            }
        }
    }

    /// Record a `+key value...` feedback line (without the leading `+`).
    ///
    /// Only the first value token is kept. Lines without a value leave the
    /// cache untouched.
    pub fn absorb(&mut self, body: &str) {
        let mut tokens = body.split(' ');
        if let (Some(key), Some(value)) = (tokens.next(), tokens.next()) {
            if !key.is_empty() {
                self.values.insert(key.to_string(), ParamValue::parse(value));
            }
        }
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Cached entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }
}
