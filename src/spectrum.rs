//! Spectrum specification: the immutable input to an acquisition, its
//! structural validation, and the derived quantities the generator and
//! dispatcher need (`num_samples`, `total_values`, per-sample energy).

use std::fmt;

use crate::codec::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectrumMode {
    Fat,
    Sfat,
    Frr,
    Fe,
    Lvs,
}

impl SpectrumMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpectrumMode::Fat => "FAT",
            SpectrumMode::Sfat => "SFAT",
            SpectrumMode::Frr => "FRR",
            SpectrumMode::Fe => "FE",
            SpectrumMode::Lvs => "LVS",
        }
    }
}

impl fmt::Display for SpectrumMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LensMode {
    HighMagnification,
    MediumMagnification,
    LowMagnification,
    WideAngle,
}

impl LensMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LensMode::HighMagnification => "HighMagnification",
            LensMode::MediumMagnification => "MediumMagnification",
            LensMode::LowMagnification => "LowMagnification",
            LensMode::WideAngle => "WideAngle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HighMagnification" => Some(LensMode::HighMagnification),
            "MediumMagnification" => Some(LensMode::MediumMagnification),
            "LowMagnification" => Some(LensMode::LowMagnification),
            "WideAngle" => Some(LensMode::WideAngle),
            _ => None,
        }
    }
}

impl Default for LensMode {
    fn default() -> Self {
        LensMode::HighMagnification
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRange {
    SmallArea,
    MediumArea,
    LargeArea,
}

impl ScanRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanRange::SmallArea => "SmallArea",
            ScanRange::MediumArea => "MediumArea",
            ScanRange::LargeArea => "LargeArea",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SmallArea" => Some(ScanRange::SmallArea),
            "MediumArea" => Some(ScanRange::MediumArea),
            "LargeArea" => Some(ScanRange::LargeArea),
            _ => None,
        }
    }
}

impl Default for ScanRange {
    fn default() -> Self {
        ScanRange::MediumArea
    }
}

#[derive(Debug)]
pub enum SpectrumError {
    InvalidParameters(String),
}

impl fmt::Display for SpectrumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpectrumError::InvalidParameters(msg) => write!(f, "invalid spectrum parameters: {msg}"),
        }
    }
}

impl std::error::Error for SpectrumError {}

/// The full definition of one acquisition, immutable once validated.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumSpec {
    pub mode: SpectrumMode,
    pub start_energy: f64,
    pub end_energy: f64,
    pub energies: Vec<f64>,
    pub step_width: f64,
    pub dwell_time: f64,
    pub pass_energy: f64,
    pub retarding_ratio: f64,
    pub lens_mode: LensMode,
    pub scan_range: ScanRange,
    pub num_scans: u32,
    pub values_per_sample: u32,
    pub num_slices: u32,
}

impl SpectrumSpec {
    /// Number of energy steps (`S`): the fixed-energy array's length for FE,
    /// or the floor division derived from the start/end/step range otherwise.
    pub fn num_samples(&self) -> usize {
        if self.mode == SpectrumMode::Fe {
            self.energies.len()
        } else {
            (((self.end_energy - self.start_energy) / self.step_width).floor() as i64 + 1).max(0) as usize
        }
    }

    pub fn total_values(&self) -> usize {
        self.num_slices as usize * self.num_samples() * self.values_per_sample as usize
    }

    /// The nominal energy for sample index `s`, before spatial/slice offsets.
    pub fn energy_at(&self, s: usize) -> f64 {
        if self.mode == SpectrumMode::Fe {
            self.energies[s]
        } else {
            self.start_energy + s as f64 * self.step_width
        }
    }

    /// Gaussian `(center, sigma)` for the synthesised peak.
    pub fn center_sigma(&self) -> (f64, f64) {
        if self.mode == SpectrumMode::Fe {
            let lo = self.energies.iter().cloned().fold(f64::INFINITY, f64::min);
            let hi = self.energies.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            ((lo + hi) / 2.0, ((hi - lo) / 6.0).max(f64::EPSILON))
        } else {
            (
                (self.start_energy + self.end_energy) / 2.0,
                ((self.end_energy - self.start_energy) / 6.0).max(f64::EPSILON),
            )
        }
    }

    /// Structural validation shared by `Define*` and `Check*`.
    pub fn validate(&self) -> Result<(), SpectrumError> {
        if self.mode == SpectrumMode::Fe {
            if self.energies.is_empty() {
                return Err(SpectrumError::InvalidParameters(
                    "Energies array must be non-empty for FE mode".to_string(),
                ));
            }
        } else {
            if self.step_width <= 0.0 {
                return Err(SpectrumError::InvalidParameters(
                    "StepWidth must be strictly positive".to_string(),
                ));
            }
            if self.end_energy < self.start_energy {
                return Err(SpectrumError::InvalidParameters(
                    "EndEnergy must be >= StartEnergy".to_string(),
                ));
            }
        }
        if self.dwell_time <= 0.0 {
            return Err(SpectrumError::InvalidParameters(
                "DwellTime must be strictly positive".to_string(),
            ));
        }
        if self.values_per_sample < 1 {
            return Err(SpectrumError::InvalidParameters(
                "ValuesPerSample must be >= 1".to_string(),
            ));
        }
        if self.num_slices < 1 {
            return Err(SpectrumError::InvalidParameters(
                "NumberOfSlices must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_energies(req: &Request) -> Vec<f64> {
    req.list("Energies")
        .map(|items| items.iter().filter_map(|v| v.as_f64()).collect())
        .unwrap_or_default()
}

/// Builds a spectrum spec from a parsed request's parameters, applying the
/// same per-field defaults for every mode (mirroring the original
/// implementation's defaults) and letting per-mode fields stay at zero/empty
/// when not applicable.
pub fn build_from_request(mode: SpectrumMode, req: &Request) -> SpectrumSpec {
    let lens_mode = req
        .str("LensMode")
        .and_then(LensMode::parse)
        .unwrap_or_default();
    let scan_range = req
        .str("ScanRange")
        .and_then(ScanRange::parse)
        .unwrap_or_default();

    let mut spec = SpectrumSpec {
        mode,
        start_energy: req.f64("StartEnergy").unwrap_or(0.0),
        end_energy: req.f64("EndEnergy").unwrap_or(0.0),
        energies: Vec::new(),
        step_width: req.f64("StepWidth").unwrap_or(1.0),
        dwell_time: req.f64("DwellTime").unwrap_or(0.1),
        pass_energy: req.f64("PassEnergy").unwrap_or(20.0),
        retarding_ratio: req.f64("RetardingRatio").unwrap_or(1.0),
        lens_mode,
        scan_range,
        num_scans: req.u32("NumberOfScans").unwrap_or(1).max(1),
        values_per_sample: req.u32("ValuesPerSample").unwrap_or(1).max(1),
        num_slices: req.u32("NumberOfSlices").unwrap_or(1).max(1),
    };

    match mode {
        SpectrumMode::Fe => {
            spec.energies = parse_energies(req);
        }
        SpectrumMode::Sfat => {
            // SFAT specifies a sample count in place of a step width; derive
            // the step from the range and requested sample count.
            if let Some(samples) = req.u32("Samples").or_else(|| req.u32("NumberOfSamples")) {
                let samples = samples.max(1);
                spec.step_width = if samples > 1 {
                    (spec.end_energy - spec.start_energy) / (samples - 1) as f64
                } else {
                    spec.end_energy - spec.start_energy
                };
            }
        }
        SpectrumMode::Lvs => {
            // LVS scans a logical voltage variable over the same
            // Start/End/StepWidth fields used for energy elsewhere.
        }
        SpectrumMode::Fat | SpectrumMode::Frr => {}
    }

    spec
}
