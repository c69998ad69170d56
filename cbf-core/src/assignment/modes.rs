//! Mode-specific payload construction.
//!
//! Each processing mode registers one [`ModeStrategy`]: the document keys it
//! needs and the parser producing its [`ModePayload`]. The builder selects a
//! strategy by table lookup.

use std::collections::BTreeSet;

use cbf_model::{ProcessingMode, ReceptorId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::assignment::request::ScanRequest;
use crate::error::{CbfError, Result};
use crate::spectrum::FrequencySlice;

/// Per-channel map entries: `(channel, value)`, channel ascending.
pub type ChannelMap<T> = Vec<(u32, T)>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchBeam {
    pub search_beam_id: u32,
    pub receptor_ids: Vec<ReceptorId>,
    #[serde(default = "enabled")]
    pub enable_output: bool,
    #[serde(default)]
    pub averaging_interval: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingBeam {
    pub timing_beam_id: u32,
    pub receptor_ids: Vec<ReceptorId>,
    #[serde(default = "enabled")]
    pub enable_output: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlbiBeam {
    pub vlbi_beam_id: u32,
    pub receptor_ids: Vec<ReceptorId>,
}

fn enabled() -> bool {
    true
}

/// Fields a processing unit needs beyond the ones every mode shares.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "function_mode")]
pub enum ModePayload {
    #[serde(rename = "CORR")]
    Corr {
        output_link_map: ChannelMap<u32>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        output_host: ChannelMap<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        output_port: ChannelMap<u16>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        channel_averaging_map: ChannelMap<u32>,
    },
    #[serde(rename = "PSS-BF")]
    Pss { search_beam: Vec<SearchBeam> },
    #[serde(rename = "PST-BF")]
    Pst { timing_beams: Vec<TimingBeam> },
    #[serde(rename = "VLBI")]
    Vlbi { vlbi_beams: Vec<VlbiBeam> },
}

impl ModePayload {
    pub fn mode(&self) -> ProcessingMode {
        match self {
            ModePayload::Corr { .. } => ProcessingMode::Corr,
            ModePayload::Pss { .. } => ProcessingMode::Pss,
            ModePayload::Pst { .. } => ProcessingMode::Pst,
            ModePayload::Vlbi { .. } => ProcessingMode::Vlbi,
        }
    }

    /// The share of this payload one slice needs. Channel maps are cut to
    /// the slice and re-based to its first channel; beam lists cover the
    /// whole band and are copied as-is.
    pub fn for_slice(&self, slice: &FrequencySlice) -> ModePayload {
        match self {
            ModePayload::Corr {
                output_link_map,
                output_host,
                output_port,
                channel_averaging_map,
            } => ModePayload::Corr {
                output_link_map: slice_map(output_link_map, slice),
                output_host: slice_map(output_host, slice),
                output_port: slice_map(output_port, slice),
                channel_averaging_map: slice_map(channel_averaging_map, slice),
            },
            other => other.clone(),
        }
    }

    pub fn output_link_map(&self) -> Option<&[(u32, u32)]> {
        match self {
            ModePayload::Corr {
                output_link_map, ..
            } => Some(output_link_map.as_slice()),
            _ => None,
        }
    }
}

/// Entries inside the slice, re-based. The entry in force at the slice's
/// first channel is carried over when no entry starts exactly there.
fn slice_map<T: Clone>(map: &ChannelMap<T>, slice: &FrequencySlice) -> ChannelMap<T> {
    let mut out = Vec::new();
    if let Some((_, value)) = map
        .iter()
        .take_while(|(channel, _)| *channel <= slice.start_channel)
        .last()
    {
        out.push((0, value.clone()));
    }
    out.extend(
        map.iter()
            .filter(|(channel, _)| {
                *channel > slice.start_channel && *channel <= slice.end_channel
            })
            .map(|(channel, value)| (channel - slice.start_channel, value.clone())),
    );
    out
}

type ParseFn = fn(&Map<String, Value>, &ScanRequest) -> Result<ModePayload>;

pub(crate) struct ModeStrategy {
    pub mode: ProcessingMode,
    pub required_keys: &'static [&'static str],
    pub parse: ParseFn,
}

static STRATEGIES: [ModeStrategy; 4] = [
    ModeStrategy {
        mode: ProcessingMode::Corr,
        required_keys: &["output_link_map"],
        parse: parse_corr,
    },
    ModeStrategy {
        mode: ProcessingMode::Pss,
        required_keys: &["search_beam"],
        parse: parse_pss,
    },
    ModeStrategy {
        mode: ProcessingMode::Pst,
        required_keys: &["timing_beams"],
        parse: parse_pst,
    },
    ModeStrategy {
        mode: ProcessingMode::Vlbi,
        required_keys: &["vlbi_beams"],
        parse: parse_vlbi,
    },
];

pub(crate) fn strategy_for(mode: ProcessingMode) -> Result<&'static ModeStrategy> {
    STRATEGIES
        .iter()
        .find(|strategy| strategy.mode == mode)
        .ok_or_else(|| {
            CbfError::Internal(format!("no payload strategy for mode {mode}"))
        })
}

fn field<T: DeserializeOwned>(fields: &Map<String, Value>, key: &str) -> Result<Option<T>> {
    fields
        .get(key)
        .map(|value| {
            T::deserialize(value).map_err(|err| {
                CbfError::Validation(format!("{key} is malformed: {err}"))
            })
        })
        .transpose()
}

fn channel_map<T: DeserializeOwned>(
    fields: &Map<String, Value>,
    key: &str,
    channel_count: Option<i64>,
) -> Result<ChannelMap<T>> {
    let map: ChannelMap<T> = field(fields, key)?.unwrap_or_default();
    for pair in map.windows(2) {
        if pair[1].0 <= pair[0].0 {
            return Err(CbfError::Validation(format!(
                "{key} channels must be strictly increasing"
            )));
        }
    }
    if let (Some((last, _)), Some(count)) = (map.last(), channel_count)
        && i64::from(*last) >= count
    {
        return Err(CbfError::Validation(format!(
            "{key} references channel {last} beyond channel_count {count}"
        )));
    }
    Ok(map)
}

fn parse_corr(fields: &Map<String, Value>, request: &ScanRequest) -> Result<ModePayload> {
    let count = request.channel_count;
    let output_link_map: ChannelMap<u32> =
        channel_map(fields, "output_link_map", count)?;
    if output_link_map.is_empty() {
        return Err(CbfError::Validation(
            "output_link_map must not be empty".to_string(),
        ));
    }
    Ok(ModePayload::Corr {
        output_link_map,
        output_host: channel_map(fields, "output_host", count)?,
        output_port: channel_map(fields, "output_port", count)?,
        channel_averaging_map: channel_map(fields, "channel_averaging_map", count)?,
    })
}

trait Beam: DeserializeOwned {
    const KEY: &'static str;
    const MAX_ID: u32;

    fn id(&self) -> u32;
    fn receptors(&self) -> &[ReceptorId];
}

impl Beam for SearchBeam {
    const KEY: &'static str = "search_beam";
    const MAX_ID: u32 = 1500;

    fn id(&self) -> u32 {
        self.search_beam_id
    }

    fn receptors(&self) -> &[ReceptorId] {
        &self.receptor_ids
    }
}

impl Beam for TimingBeam {
    const KEY: &'static str = "timing_beams";
    const MAX_ID: u32 = 16;

    fn id(&self) -> u32 {
        self.timing_beam_id
    }

    fn receptors(&self) -> &[ReceptorId] {
        &self.receptor_ids
    }
}

impl Beam for VlbiBeam {
    const KEY: &'static str = "vlbi_beams";
    const MAX_ID: u32 = 20;

    fn id(&self) -> u32 {
        self.vlbi_beam_id
    }

    fn receptors(&self) -> &[ReceptorId] {
        &self.receptor_ids
    }
}

fn beams<B: Beam>(fields: &Map<String, Value>, request: &ScanRequest) -> Result<Vec<B>> {
    let beams: Vec<B> = field(fields, B::KEY)?.unwrap_or_default();
    if beams.is_empty() {
        return Err(CbfError::Validation(format!("{} must not be empty", B::KEY)));
    }

    let mut ids = BTreeSet::new();
    for beam in &beams {
        let id = beam.id();
        if !(1..=B::MAX_ID).contains(&id) {
            return Err(CbfError::Validation(format!(
                "{} id {id} outside 1..={}",
                B::KEY,
                B::MAX_ID
            )));
        }
        if !ids.insert(id) {
            return Err(CbfError::Validation(format!(
                "{} id {id} listed more than once",
                B::KEY
            )));
        }
        if beam.receptors().is_empty() {
            return Err(CbfError::Validation(format!(
                "{} {id} has no receptors",
                B::KEY
            )));
        }
        if let Some(stray) = beam
            .receptors()
            .iter()
            .find(|r| !request.receptor_ids.contains(*r))
        {
            return Err(CbfError::Validation(format!(
                "{} {id} uses receptor {stray} outside the scan",
                B::KEY
            )));
        }
    }
    Ok(beams)
}

fn parse_pss(fields: &Map<String, Value>, request: &ScanRequest) -> Result<ModePayload> {
    Ok(ModePayload::Pss {
        search_beam: beams(fields, request)?,
    })
}

fn parse_pst(fields: &Map<String, Value>, request: &ScanRequest) -> Result<ModePayload> {
    Ok(ModePayload::Pst {
        timing_beams: beams(fields, request)?,
    })
}

fn parse_vlbi(fields: &Map<String, Value>, request: &ScanRequest) -> Result<ModePayload> {
    Ok(ModePayload::Vlbi {
        vlbi_beams: beams(fields, request)?,
    })
}
