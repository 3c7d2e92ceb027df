use anyhow::{bail, Context};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use ds1000z_rs::discovery::{self, ScanWindow};
use ds1000z_rs::{Channel, Ds1000z, MeasurementType, WaveformMode};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

const SHELL_HOWTO: &str = "
Enter a command. It will be sent to the scope.
If the command contains a question mark ('?'), the answer
will be read from the device.
Quit the shell with 'quit', 'exit' or by pressing Ctrl-C
";

const MEASUREMENT_ITEMS: [&str; 33] = [
    "vmax",
    "vmin",
    "vpp",
    "vtop",
    "vbase",
    "vamp",
    "vavg",
    "vrms",
    "overshoot",
    "preshoot",
    "marea",
    "mparea",
    "period",
    "frequency",
    "rtime",
    "ftime",
    "pwidth",
    "nwidth",
    "pduty",
    "nduty",
    "rdelay",
    "fdelay",
    "rphase",
    "fphase",
    "tvmax",
    "tvmin",
    "pslewrate",
    "nslewrate",
    "vupper",
    "vmid",
    "vlower",
    "variance",
    "pvrms",
];

#[derive(Parser)]
#[command(
    name = "ds1000z",
    version,
    about = "Control a Rigol DS1000Z series oscilloscope over the network"
)]
struct Cli {
    /// Print more details of what is going on
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Print protocol level debug output
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct DeviceArg {
    /// Hostname or IP of the scope, discovered via mDNS when omitted
    device: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Search the network for DS1000Z oscilloscopes
    Discover,
    /// Show vendor, product, serial and firmware of the scope
    Info(DeviceArg),
    /// Send a raw SCPI command, a query if it contains a '?'
    Cmd {
        command: String,
        #[command(flatten)]
        device: DeviceArg,
    },
    /// Save an image of the screen
    SaveScreen {
        /// The filename template for the image, {ts} expands to a timestamp
        #[arg(short, long, default_value = "ds1000z-scope-display_{ts}.png")]
        filename: String,
        /// Opacity of the black mask dimming the on-screen controls
        #[arg(short, long, default_value_t = 0.5)]
        overlay: f64,
        #[command(flatten)]
        device: DeviceArg,
    },
    /// Save the waveform data of all displayed channels to a file
    SaveData {
        /// The filename template, the extension picks the delimiter
        #[arg(short, long, default_value = "ds1000z-scope-values_{ts}.csv")]
        filename: String,
        /// NORMal reads the displayed trace, RAW the full memory
        #[arg(long, default_value = "NORMal", value_parser = parse_waveform_mode)]
        mode: WaveformMode,
        /// Leave out the extra column of time values
        #[arg(long)]
        without_time: bool,
        #[command(flatten)]
        device: DeviceArg,
    },
    /// View and change settings of the oscilloscope
    Settings {
        /// Change the timebase to this value (in seconds/div)
        #[arg(long, allow_negative_numbers = true)]
        timebase: Option<f64>,
        /// Change the timebase offset to this value (in seconds)
        #[arg(long, allow_negative_numbers = true)]
        timebase_offset: Option<f64>,
        #[command(flatten)]
        device: DeviceArg,
    },
    /// Query properties of the scope
    Properties {
        /// The properties to query, separated by commas
        properties: String,
        #[command(flatten)]
        device: DeviceArg,
    },
    /// Start the data acquisition
    Run(DeviceArg),
    /// Stop the data acquisition
    Stop(DeviceArg),
    /// Arm the scope for a single trigger
    Single(DeviceArg),
    /// Force a trigger
    Tforce(DeviceArg),
    /// Interactive SCPI shell
    Shell(DeviceArg),
    /// Read a measurement value such as vpp or frequency
    Measure {
        #[arg(value_parser = parse_measurement_item)]
        item: String,
        /// The channel to measure on
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=4))]
        channel: u8,
        /// Statistic variant of the measurement
        #[arg(short = 't', long = "type", default_value = "CURRent", value_parser = parse_measurement_type)]
        measurement_type: MeasurementType,
        #[command(flatten)]
        device: DeviceArg,
    },
}

fn parse_waveform_mode(text: &str) -> Result<WaveformMode, String> {
    match text.to_ascii_uppercase().as_str() {
        "NORM" | "NORMAL" => Ok(WaveformMode::Normal),
        "MAX" | "MAXIMUM" => Ok(WaveformMode::Maximum),
        "RAW" => Ok(WaveformMode::Raw),
        _ => Err(format!("unknown waveform mode '{text}'")),
    }
}

fn parse_measurement_type(text: &str) -> Result<MeasurementType, String> {
    match text.to_ascii_uppercase().as_str() {
        "CURR" | "CURRENT" => Ok(MeasurementType::Current),
        "MAX" | "MAXIMUM" => Ok(MeasurementType::Maximum),
        "MIN" | "MINIMUM" => Ok(MeasurementType::Minimum),
        "AVER" | "AVERAGES" => Ok(MeasurementType::Averages),
        "DEV" | "DEVIATION" => Ok(MeasurementType::Deviation),
        _ => Err(format!("unknown measurement type '{text}'")),
    }
}

fn parse_measurement_item(text: &str) -> Result<String, String> {
    let item = text.to_ascii_lowercase();
    if MEASUREMENT_ITEMS.contains(&item.as_str()) {
        Ok(item)
    } else {
        Err(format!("unknown measurement item '{text}'"))
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match cli.command {
        Command::Discover => discover_command(cli.verbose),
        Command::Info(device) => info_command(&mut open_scope(&device, cli.verbose)?),
        Command::Cmd { command, device } => {
            cmd_command(&mut open_scope(&device, cli.verbose)?, &command)
        }
        Command::SaveScreen {
            filename,
            overlay,
            device,
        } => save_screen_command(
            &mut open_scope(&device, cli.verbose)?,
            &filename,
            overlay,
            cli.verbose,
        ),
        Command::SaveData {
            filename,
            mode,
            without_time,
            device,
        } => save_data_command(
            &mut open_scope(&device, cli.verbose)?,
            &filename,
            mode,
            !without_time,
            cli.verbose,
        ),
        Command::Settings {
            timebase,
            timebase_offset,
            device,
        } => settings_command(
            &mut open_scope(&device, cli.verbose)?,
            timebase,
            timebase_offset,
            cli.verbose,
        ),
        Command::Properties { properties, device } => properties_command(
            &mut open_scope(&device, cli.verbose)?,
            &properties,
            cli.verbose,
        ),
        Command::Run(device) => Ok(open_scope(&device, cli.verbose)?.run()?),
        Command::Stop(device) => Ok(open_scope(&device, cli.verbose)?.stop()?),
        Command::Single(device) => Ok(open_scope(&device, cli.verbose)?.single()?),
        Command::Tforce(device) => Ok(open_scope(&device, cli.verbose)?.tforce()?),
        Command::Shell(device) => shell_command(&mut open_scope(&device, cli.verbose)?),
        Command::Measure {
            item,
            channel,
            measurement_type,
            device,
        } => {
            let channel = Channel::try_from(channel)?;
            measure_command(
                &mut open_scope(&device, cli.verbose)?,
                &item,
                measurement_type,
                channel,
            )
        }
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Connect to the named device, or to the single scope found on the
/// network when none was named.
fn open_scope(device: &DeviceArg, verbose: bool) -> anyhow::Result<Ds1000z> {
    let address = match &device.device {
        Some(address) => address.clone(),
        None => {
            let devices = discovery::discover(&ScanWindow::default())?;
            let picked = discovery::select_single(devices)?;
            if verbose {
                println!("Found a scope: {} @ {}", picked.model, picked.address);
            }
            picked.address.to_string()
        }
    };
    Ok(Ds1000z::connect(&address)?)
}

fn discover_command(verbose: bool) -> anyhow::Result<()> {
    for device in discovery::discover(&ScanWindow::default())? {
        if verbose {
            println!(
                "Found a {} with the IP Address {}.",
                device.model, device.address
            );
        } else {
            println!("{}", device.address);
        }
    }
    Ok(())
}

fn info_command(scope: &mut Ds1000z) -> anyhow::Result<()> {
    let identity = scope.identity()?;
    println!(
        "\nVendor:   {}\nProduct:  {}\nSerial:   {}\nFirmware: {}\n",
        identity.vendor, identity.product, identity.serial, identity.firmware
    );
    Ok(())
}

fn cmd_command(scope: &mut Ds1000z, command: &str) -> anyhow::Result<()> {
    if command.contains('?') {
        println!("{}", scope.query(command)?);
    } else {
        scope.write(command)?;
        scope.check_error()?;
    }
    Ok(())
}

fn save_screen_command(
    scope: &mut Ds1000z,
    template: &str,
    overlay: f64,
    verbose: bool,
) -> anyhow::Result<()> {
    let filename = expand_filename(template);
    scope.save_screen(Path::new(&filename), overlay)?;
    if verbose {
        println!("Saved file: {filename}");
    } else {
        println!("{filename}");
    }
    Ok(())
}

fn save_data_command(
    scope: &mut Ds1000z,
    template: &str,
    mode: WaveformMode,
    with_time: bool,
    verbose: bool,
) -> anyhow::Result<()> {
    let filename = expand_filename(template);
    let path = Path::new(&filename);
    let delimiter = delimiter_for(path)?;

    let channels = scope.displayed_channels()?;
    if channels.is_empty() {
        bail!("No channel is displayed, there is nothing to save");
    }
    let mut waveforms = Vec::with_capacity(channels.len());
    for &channel in &channels {
        waveforms.push(scope.waveform_samples(channel, mode)?);
    }
    let length = waveforms[0].len();
    if waveforms.iter().any(|waveform| waveform.len() != length) {
        bail!("Different number of samples read for different channels");
    }

    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_path(path)
        .with_context(|| format!("Could not open {filename}"))?;

    let mut header: Vec<String> = Vec::new();
    if with_time {
        header.push("TIME".to_string());
    }
    header.extend(channels.iter().map(ToString::to_string));
    writer.write_record(&header)?;

    let times = waveforms[0].timestamps();
    for row in 0..length {
        let volts: Vec<f64> = waveforms
            .iter()
            .map(|waveform| waveform.samples()[row])
            .collect();
        let time = with_time.then(|| times[row]);
        writer.write_record(data_record(time, &volts))?;
    }
    writer.flush()?;

    if verbose {
        println!("Saved file: {filename}");
    } else {
        println!("{filename}");
    }
    Ok(())
}

/// One CSV row: the optional time in plain decimal notation, every
/// voltage in two-digit scientific notation.
fn data_record(time: Option<f64>, volts: &[f64]) -> Vec<String> {
    let mut record = Vec::with_capacity(volts.len() + 1);
    if let Some(time) = time {
        record.push(time.to_string());
    }
    record.extend(volts.iter().map(|value| format!("{value:.2e}")));
    record
}

fn delimiter_for(path: &Path) -> anyhow::Result<u8> {
    match path.extension().and_then(OsStr::to_str) {
        Some("csv") => Ok(b','),
        Some("txt") => Ok(b'\t'),
        Some(other) => bail!("Cannot write '{other}' files, use .csv or .txt"),
        None => bail!("Could not detect the file type extension from the filename"),
    }
}

fn expand_filename(template: &str) -> String {
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    template.replace("{ts}", &timestamp)
}

fn settings_command(
    scope: &mut Ds1000z,
    timebase: Option<f64>,
    timebase_offset: Option<f64>,
    verbose: bool,
) -> anyhow::Result<()> {
    if let Some(scale) = timebase {
        scope.set_timebase_scale(scale)?;
        scope.check_error()?;
    }
    if let Some(offset) = timebase_offset {
        scope.set_timebase_offset(offset)?;
        scope.check_error()?;
    }

    println!("sample_rate={}", scope.sample_rate()?);
    println!("timebase_scale={}", scope.timebase_scale()?);
    println!("timebase_offset={}", scope.timebase_offset()?);
    let displayed = scope.displayed_channels()?;
    println!(
        "displayed_channels={}",
        displayed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    );
    if verbose {
        for &channel in &displayed {
            println!("{channel}:");
            println!("  scale: {} V/div", scope.channel_scale(channel)?);
            println!("  offset: {} V", scope.channel_offset(channel)?);
            println!("  probe_ratio: {}", scope.probe_ratio(channel)?);
        }
    }
    Ok(())
}

fn properties_command(scope: &mut Ds1000z, properties: &str, verbose: bool) -> anyhow::Result<()> {
    for name in properties.split(',') {
        let name = name.trim();
        let value = property_value(scope, name)?;
        if verbose {
            println!("{name}: {value}");
        } else {
            println!("{value}");
        }
    }
    Ok(())
}

fn property_value(scope: &mut Ds1000z, name: &str) -> anyhow::Result<String> {
    Ok(match name {
        "idn" => scope.idn()?,
        "vendor" => scope.identity()?.vendor,
        "product" => scope.identity()?.product,
        "serial" => scope.identity()?.serial,
        "firmware" => scope.identity()?.firmware,
        "memory_depth" => scope.memory_depth()?.to_string(),
        "sample_rate" => scope.sample_rate()?.to_string(),
        "timebase_scale" => scope.timebase_scale()?.to_string(),
        "timebase_offset" => scope.timebase_offset()?.to_string(),
        "displayed_channels" => scope
            .displayed_channels()?
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" "),
        "trigger_status" => scope.trigger_status()?.to_string(),
        "running" => scope.is_running()?.to_string(),
        other => bail!("Unknown property: {other}"),
    })
}

fn shell_command(scope: &mut Ds1000z) -> anyhow::Result<()> {
    println!("{SHELL_HOWTO}");
    println!("> *IDN?");
    println!("{}", scope.idn()?);

    let mut editor = DefaultEditor::new()?;
    let history = history_path();
    if let Some(path) = &history {
        // A missing history file on the first run is expected.
        let _ = editor.load_history(path);
    }
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if line == "quit" || line == "exit" {
                    break;
                }
                let _ = editor.add_history_entry(&line);
                if let Err(error) = run_shell_line(scope, &line) {
                    println!("{error}");
                    if scope.is_closed() {
                        // A timed out query closes the session. Dial
                        // again so the shell stays usable.
                        scope.reconnect()?;
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("\nCtrl-C pressed.");
                break;
            }
            Err(ReadlineError::Eof) => break,
            Err(error) => return Err(error.into()),
        }
    }
    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
    println!("Exiting...");
    Ok(())
}

fn run_shell_line(scope: &mut Ds1000z, line: &str) -> anyhow::Result<()> {
    if line.contains('?') {
        println!("{}", scope.query(line)?);
    } else {
        scope.write(line)?;
        scope.check_error()?;
    }
    Ok(())
}

fn history_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ds1000z_history"))
}

fn measure_command(
    scope: &mut Ds1000z,
    item: &str,
    measurement_type: MeasurementType,
    channel: Channel,
) -> anyhow::Result<()> {
    if let Some(value) = scope.measurement(item, measurement_type, channel)? {
        println!("{value}");
    }
    Ok(())
}
