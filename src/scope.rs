use crate::block::BinaryBlock;
use crate::session::{ProtocolError, ScpiSession, SessionError, SessionState};
use crate::transport::{ConnectionConfig, TcpTransport};
use std::fmt;
use std::str::FromStr;

/// One of the four analog input channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Ch1,
    Ch2,
    Ch3,
    Ch4,
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid channel '{0}', this scope has channels 1 to 4")]
pub struct InvalidChannel(pub String);

impl Channel {
    pub const ALL: [Self; 4] = [Self::Ch1, Self::Ch2, Self::Ch3, Self::Ch4];

    pub fn number(self) -> u8 {
        match self {
            Self::Ch1 => 1,
            Self::Ch2 => 2,
            Self::Ch3 => 3,
            Self::Ch4 => 4,
        }
    }
}

impl fmt::Display for Channel {
    /// The channel token used in SCPI messages, e.g. `CHAN1`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CHAN{}", self.number())
    }
}

impl TryFrom<u8> for Channel {
    type Error = InvalidChannel;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        match number {
            1 => Ok(Self::Ch1),
            2 => Ok(Self::Ch2),
            3 => Ok(Self::Ch3),
            4 => Ok(Self::Ch4),
            other => Err(InvalidChannel(other.to_string())),
        }
    }
}

impl FromStr for Channel {
    type Err = InvalidChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let number: u8 = s
            .trim()
            .parse()
            .map_err(|_| InvalidChannel(s.to_string()))?;
        Self::try_from(number)
    }
}

/// Acquisition state reported by `:TRIGger:STATus?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStatus {
    Td,
    Wait,
    Run,
    Auto,
    Stop,
}

impl TriggerStatus {
    fn from_reply(reply: &str) -> Result<Self, ProtocolError> {
        match reply.trim() {
            "TD" => Ok(Self::Td),
            "WAIT" => Ok(Self::Wait),
            "RUN" => Ok(Self::Run),
            "AUTO" => Ok(Self::Auto),
            "STOP" => Ok(Self::Stop),
            other => Err(ProtocolError::TriggerStatus(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Td => "TD",
            Self::Wait => "WAIT",
            Self::Run => "RUN",
            Self::Auto => "AUTO",
            Self::Stop => "STOP",
        }
    }
}

impl fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four fields of the `*IDN?` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub vendor: String,
    pub product: String,
    pub serial: String,
    pub firmware: String,
}

impl Identity {
    fn parse(idn: &str) -> Result<Self, ProtocolError> {
        let fields: Vec<&str> = idn.split(',').collect();
        let [vendor, product, serial, firmware] = fields.as_slice() else {
            return Err(ProtocolError::Identity(idn.to_string()));
        };
        Ok(Self {
            vendor: vendor.trim().to_string(),
            product: product.trim().to_string(),
            serial: serial.trim().to_string(),
            firmware: firmware.trim().to_string(),
        })
    }
}

/// Statistic selector for measurement queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeasurementType {
    #[default]
    Current,
    Maximum,
    Minimum,
    Averages,
    Deviation,
}

impl MeasurementType {
    pub fn as_scpi(self) -> &'static str {
        match self {
            Self::Current => "CURRent",
            Self::Maximum => "MAXimum",
            Self::Minimum => "MINimum",
            Self::Averages => "AVERages",
            Self::Deviation => "DEViation",
        }
    }
}

/// Control handle for a DS1000Z-series oscilloscope.
///
/// Every accessor performs a fresh query round trip; nothing is cached,
/// so readings taken by separate calls can interleave with state
/// changes on the instrument. Callers needing a consistent view must
/// take their reads as one deliberate sequence.
pub struct Ds1000z {
    session: ScpiSession,
    address: String,
    config: ConnectionConfig,
}

impl Ds1000z {
    /// Grid columns of the display, used to resolve `AUTO` memory depth.
    const H_GRID: f64 = 12.0;
    /// Readings beyond this magnitude mean "no valid measurement".
    const MEASUREMENT_INVALID: f64 = 9.9e36;

    /// Connect to the instrument at `address` ("host" or "host:port").
    pub fn connect(address: &str) -> Result<Self, SessionError> {
        Self::connect_with_config(address, ConnectionConfig::default())
    }

    pub fn connect_with_config(
        address: &str,
        config: ConnectionConfig,
    ) -> Result<Self, SessionError> {
        let transport = TcpTransport::connect(address, &config)?;
        log::info!("Connected to scope at {}", address);
        Ok(Self {
            session: ScpiSession::new(Box::new(transport)),
            address: address.to_string(),
            config,
        })
    }

    /// Wrap an existing session, e.g. one built on a custom transport.
    /// `reconnect` only works for handles created via `connect`.
    pub fn from_session(session: ScpiSession) -> Self {
        Self {
            session,
            address: String::new(),
            config: ConnectionConfig::default(),
        }
    }

    /// Drop the current session and dial the instrument again.
    pub fn reconnect(&mut self) -> Result<(), SessionError> {
        log::info!("Reconnecting to {}", self.address);
        let transport = TcpTransport::connect(&self.address, &self.config)?;
        self.session = ScpiSession::new(Box::new(transport));
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), SessionError> {
        self.session.close()
    }

    pub fn is_closed(&self) -> bool {
        self.session.state() == SessionState::Closed
    }

    /// Send a raw SCPI command.
    pub fn write(&mut self, command: &str) -> Result<(), SessionError> {
        self.session.send_command(command)
    }

    /// Send a raw SCPI query and return the text reply.
    pub fn query(&mut self, command: &str) -> Result<String, SessionError> {
        self.session.send_query(command)
    }

    /// Send a raw SCPI query whose reply is a binary block.
    pub fn query_binary(&mut self, command: &str) -> Result<BinaryBlock, SessionError> {
        self.session.send_binary_query(command)
    }

    /// Surface a pending instrument error as `SessionError::Device`.
    pub fn check_error(&mut self) -> Result<(), SessionError> {
        self.session.check_error()
    }

    pub fn idn(&mut self) -> Result<String, SessionError> {
        self.session.send_query("*IDN?")
    }

    pub fn identity(&mut self) -> Result<Identity, SessionError> {
        let idn = self.idn()?;
        Ok(Identity::parse(&idn)?)
    }

    pub fn channel_displayed(&mut self, channel: Channel) -> Result<bool, SessionError> {
        let reply = self.session.send_query(&format!(":{channel}:DISPlay?"))?;
        let flag: i32 = reply.trim().parse().map_err(|_| ProtocolError::NumericField {
            field: "display flag",
            text: reply.clone(),
        })?;
        Ok(flag != 0)
    }

    /// The channels currently shown on screen, in ascending channel
    /// order.
    pub fn displayed_channels(&mut self) -> Result<Vec<Channel>, SessionError> {
        let mut displayed = Vec::new();
        for channel in Channel::ALL {
            if self.channel_displayed(channel)? {
                displayed.push(channel);
            }
        }
        Ok(displayed)
    }

    pub fn display_channel(&mut self, channel: Channel, on: bool) -> Result<(), SessionError> {
        self.session
            .send_command(&format!(":{channel}:DISPlay {}", i32::from(on)))
    }

    /// Show `channel` and hide the other three.
    pub fn display_only_channel(&mut self, channel: Channel) -> Result<(), SessionError> {
        for other in Channel::ALL {
            self.display_channel(other, other == channel)?;
        }
        Ok(())
    }

    /// Vertical scale of a channel in volts per division.
    pub fn channel_scale(&mut self, channel: Channel) -> Result<f64, SessionError> {
        self.query_f64(&format!(":{channel}:SCALe?"), "channel scale")
    }

    /// Vertical offset of a channel in volts.
    pub fn channel_offset(&mut self, channel: Channel) -> Result<f64, SessionError> {
        self.query_f64(&format!(":{channel}:OFFSet?"), "channel offset")
    }

    pub fn probe_ratio(&mut self, channel: Channel) -> Result<f64, SessionError> {
        self.query_f64(&format!(":{channel}:PROBe?"), "probe ratio")
    }

    /// Main timebase scale in seconds per division.
    pub fn timebase_scale(&mut self) -> Result<f64, SessionError> {
        self.query_f64(":TIMebase:MAIN:SCALe?", "timebase scale")
    }

    pub fn timebase_offset(&mut self) -> Result<f64, SessionError> {
        self.query_f64(":TIMebase:MAIN:OFFSet?", "timebase offset")
    }

    /// Set the main timebase scale in seconds per division. The
    /// instrument snaps the value to the nearest supported step.
    pub fn set_timebase_scale(&mut self, seconds_per_div: f64) -> Result<(), SessionError> {
        self.session
            .send_command(&format!(":TIMebase:MAIN:SCALe {seconds_per_div}"))
    }

    pub fn set_timebase_offset(&mut self, seconds: f64) -> Result<(), SessionError> {
        self.session
            .send_command(&format!(":TIMebase:MAIN:OFFSet {seconds}"))
    }

    /// Current sample rate in samples per second.
    pub fn sample_rate(&mut self) -> Result<f64, SessionError> {
        self.query_f64(":ACQuire:SRATe?", "sample rate")
    }

    /// Acquisition memory depth in points. An `AUTO` reply is resolved
    /// to the depth the instrument is effectively using, which is the
    /// on-screen time span times the sample rate.
    pub fn memory_depth(&mut self) -> Result<f64, SessionError> {
        let reply = self.session.send_query(":ACQuire:MDEPth?")?;
        if reply.trim() == "AUTO" {
            let rate = self.sample_rate()?;
            let scale = self.timebase_scale()?;
            return Ok(Self::H_GRID * scale * rate);
        }
        Ok(parse_f64(&reply, "memory depth")?)
    }

    /// Set the acquisition memory depth. The instrument only accepts a
    /// new depth while acquiring, so a stopped scope is briefly started.
    pub fn set_memory_depth(&mut self, points: u32) -> Result<(), SessionError> {
        let was_running = self.is_running()?;
        if !was_running {
            self.run()?;
        }
        self.session
            .send_command(&format!(":ACQuire:MDEPth {points}"))?;
        if !was_running {
            self.stop()?;
        }
        Ok(())
    }

    pub fn trigger_status(&mut self) -> Result<TriggerStatus, SessionError> {
        let reply = self.session.send_query(":TRIGger:STATus?")?;
        Ok(TriggerStatus::from_reply(&reply)?)
    }

    pub fn is_running(&mut self) -> Result<bool, SessionError> {
        Ok(self.trigger_status()? != TriggerStatus::Stop)
    }

    /// Start waveform acquisition.
    pub fn run(&mut self) -> Result<(), SessionError> {
        self.session.send_command(":RUN")
    }

    /// Stop waveform acquisition.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        self.session.send_command(":STOP")
    }

    /// Arm a single acquisition.
    pub fn single(&mut self) -> Result<(), SessionError> {
        self.session.send_command(":SINGle")
    }

    /// Force a trigger event.
    pub fn tforce(&mut self) -> Result<(), SessionError> {
        self.session.send_command(":TFORce")
    }

    /// Read a measurement item such as `vpp` or `frequency` from a
    /// channel. `None` means the instrument cannot produce the value
    /// right now (it reports an out-of-range marker instead).
    pub fn measurement(
        &mut self,
        item: &str,
        measurement_type: MeasurementType,
        channel: Channel,
    ) -> Result<Option<f64>, SessionError> {
        let item = item.trim().to_ascii_uppercase();
        let command = match measurement_type {
            MeasurementType::Current => format!(":MEASure:ITEM? {item},{channel}"),
            statistic => format!(
                ":MEASure:STATistic:ITEM? {},{item},{channel}",
                statistic.as_scpi()
            ),
        };
        let value = parse_f64(&self.session.send_query(&command)?, "measurement")?;
        if value.abs() > Self::MEASUREMENT_INVALID {
            return Ok(None);
        }
        Ok(Some(value))
    }

    fn query_f64(&mut self, command: &str, field: &'static str) -> Result<f64, SessionError> {
        let reply = self.session.send_query(command)?;
        Ok(parse_f64(&reply, field)?)
    }
}

pub(crate) fn parse_f64(text: &str, field: &'static str) -> Result<f64, ProtocolError> {
    text.trim()
        .parse()
        .map_err(|_| ProtocolError::NumericField {
            field,
            text: text.to_string(),
        })
}
