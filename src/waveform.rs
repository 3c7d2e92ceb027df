use crate::scope::{parse_f64, Channel, Ds1000z};
use crate::session::{ProtocolError, SessionError};

/// Sample encoding of `:WAVeform:DATA?` transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveformFormat {
    Byte,
    Word,
    Ascii,
}

impl WaveformFormat {
    /// Most points one `:WAVeform:DATA?` transfer can carry in this
    /// format. These are fixed limits of the instrument.
    pub fn max_points_per_fetch(self) -> usize {
        match self {
            Self::Byte => 250_000,
            Self::Word => 125_000,
            Self::Ascii => 15_625,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Byte),
            1 => Some(Self::Word),
            2 => Some(Self::Ascii),
            _ => None,
        }
    }
}

/// Source of the sample data: the on-screen trace or the full
/// acquisition memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaveformMode {
    /// The 1200 points currently displayed.
    #[default]
    Normal,
    /// Full memory when stopped, displayed points otherwise.
    Maximum,
    /// Full acquisition memory. Requires a stopped scope.
    Raw,
}

impl WaveformMode {
    pub fn as_scpi(self) -> &'static str {
        match self {
            Self::Normal => "NORMal",
            Self::Maximum => "MAXimum",
            Self::Raw => "RAW",
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Normal),
            1 => Some(Self::Maximum),
            2 => Some(Self::Raw),
            _ => None,
        }
    }
}

/// The ten fields of `:WAVeform:PREamble?`, describing how to turn raw
/// sample data into calibrated values.
#[derive(Debug, Clone, PartialEq)]
pub struct Preamble {
    pub format: WaveformFormat,
    pub mode: WaveformMode,
    pub points: usize,
    pub averages: u32,
    pub x_increment: f64,
    pub x_origin: f64,
    pub x_reference: f64,
    pub y_increment: f64,
    pub y_origin: f64,
    pub y_reference: f64,
}

impl Preamble {
    pub(crate) fn parse(reply: &str) -> Result<Self, ProtocolError> {
        let fields: Vec<&str> = reply.split(',').collect();
        if fields.len() != 10 {
            return Err(ProtocolError::Preamble(format!(
                "expected 10 fields, got {} in '{reply}'",
                fields.len()
            )));
        }

        let format_code: u8 =
            fields[0]
                .trim()
                .parse()
                .map_err(|_| ProtocolError::NumericField {
                    field: "format code",
                    text: fields[0].to_string(),
                })?;
        let format = WaveformFormat::from_code(format_code)
            .ok_or_else(|| ProtocolError::Preamble(format!("unknown format code {format_code}")))?;

        let mode_code: u8 = fields[1]
            .trim()
            .parse()
            .map_err(|_| ProtocolError::NumericField {
                field: "mode code",
                text: fields[1].to_string(),
            })?;
        let mode = WaveformMode::from_code(mode_code)
            .ok_or_else(|| ProtocolError::Preamble(format!("unknown mode code {mode_code}")))?;

        let points = fields[2]
            .trim()
            .parse()
            .map_err(|_| ProtocolError::NumericField {
                field: "point count",
                text: fields[2].to_string(),
            })?;
        let averages = fields[3]
            .trim()
            .parse()
            .map_err(|_| ProtocolError::NumericField {
                field: "average count",
                text: fields[3].to_string(),
            })?;

        Ok(Self {
            format,
            mode,
            points,
            averages,
            x_increment: parse_f64(fields[4], "x increment")?,
            x_origin: parse_f64(fields[5], "x origin")?,
            x_reference: parse_f64(fields[6], "x reference")?,
            y_increment: parse_f64(fields[7], "y increment")?,
            y_origin: parse_f64(fields[8], "y origin")?,
            y_reference: parse_f64(fields[9], "y reference")?,
        })
    }

    /// Calibrated voltage of one raw sample value.
    pub fn voltage(&self, raw: f64) -> f64 {
        (raw - self.y_reference - self.y_origin) * self.y_increment
    }

    /// Time of the sample at `index`, relative to the trigger.
    pub fn timestamp(&self, index: usize) -> f64 {
        index as f64 * self.x_increment + self.x_origin
    }
}

/// A fully acquired, calibrated waveform.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    preamble: Preamble,
    samples: Vec<f64>,
}

impl Waveform {
    pub(crate) fn new(preamble: Preamble, samples: Vec<f64>) -> Self {
        Self { preamble, samples }
    }

    pub fn preamble(&self) -> &Preamble {
        &self.preamble
    }

    /// Sample voltages in acquisition order.
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// The time axis matching [`Self::samples`].
    pub fn timestamps(&self) -> Vec<f64> {
        (0..self.samples.len())
            .map(|index| self.preamble.timestamp(index))
            .collect()
    }

    /// (timestamp, voltage) pairs in acquisition order.
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.samples
            .iter()
            .enumerate()
            .map(|(index, &voltage)| (self.preamble.timestamp(index), voltage))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Raw sample values of one transfer, still uncalibrated.
fn decode_chunk(format: WaveformFormat, payload: &[u8]) -> Result<Vec<f64>, ProtocolError> {
    match format {
        WaveformFormat::Byte => Ok(payload.iter().map(|&raw| f64::from(raw)).collect()),
        WaveformFormat::Word => {
            if payload.len() % 2 != 0 {
                return Err(ProtocolError::OddWordPayload(payload.len()));
            }
            Ok(payload
                .chunks_exact(2)
                .map(|pair| f64::from(u16::from_le_bytes([pair[0], pair[1]])))
                .collect())
        }
        WaveformFormat::Ascii => {
            let text = String::from_utf8(payload.to_vec())?;
            text.split(',')
                .map(|sample| parse_f64(sample, "waveform sample"))
                .collect()
        }
    }
}

impl Ds1000z {
    /// Query and parse the preamble of the currently selected waveform
    /// source.
    pub fn waveform_preamble(&mut self) -> Result<Preamble, SessionError> {
        let reply = self.query(":WAVeform:PREamble?")?;
        Ok(Preamble::parse(&reply)?)
    }

    /// Acquire the waveform of `channel` as calibrated voltages.
    ///
    /// Raw mode reads the full acquisition memory, which the instrument
    /// only serves while stopped, so acquisition is stopped first.
    /// Large captures are transferred in as many chunks as the sample
    /// format requires.
    pub fn waveform_samples(
        &mut self,
        channel: Channel,
        mode: WaveformMode,
    ) -> Result<Waveform, SessionError> {
        if mode == WaveformMode::Raw {
            self.stop()?;
        }
        self.write(&format!(":WAVeform:SOURce {channel}"))?;
        self.write(&format!(":WAVeform:MODE {}", mode.as_scpi()))?;
        self.write(":WAVeform:FORMat BYTE")?;

        let preamble = self.waveform_preamble()?;
        log::debug!(
            "Fetching {} points from {} in {:?} format",
            preamble.points,
            channel,
            preamble.format
        );
        let samples = self.fetch_samples(&preamble, preamble.format.max_points_per_fetch())?;
        Ok(Waveform::new(preamble, samples))
    }

    /// Chunked `:WAVeform:DATA?` loop. A transfer that does not hold
    /// exactly the requested range aborts the whole acquisition; the
    /// instrument state changed mid-transfer and mixing chunks from
    /// different acquisitions would go unnoticed otherwise.
    pub(crate) fn fetch_samples(
        &mut self,
        preamble: &Preamble,
        max_per_fetch: usize,
    ) -> Result<Vec<f64>, SessionError> {
        let total = preamble.points;
        let mut raw = Vec::with_capacity(total);
        // STARt/STOP positions are 1-based and inclusive.
        let mut position = 1usize;
        while raw.len() < total {
            let end = (position + max_per_fetch - 1).min(total);
            let expected = end - position + 1;
            self.write(&format!(":WAVeform:STARt {position}"))?;
            self.write(&format!(":WAVeform:STOP {end}"))?;
            let block = self.query_binary(":WAVeform:DATA?")?;
            let chunk = decode_chunk(preamble.format, block.as_bytes())?;
            if chunk.len() != expected {
                return Err(ProtocolError::ShortChunk {
                    expected,
                    got: chunk.len(),
                }
                .into());
            }
            raw.extend(chunk);
            position = end + 1;
        }
        Ok(raw.into_iter().map(|value| preamble.voltage(value)).collect())
    }
}
