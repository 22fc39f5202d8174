//! decode-reg - look at and change the registers of the
//! FPGA cores of a PCIe data-acquisition board.
//!
//! Exit code is 0 on success, 1 on any failure (bad
//! arguments, core not found on the bus, device errors,
//! acquisition timeout).

#[macro_use] extern crate log;
extern crate env_logger;
extern crate clap;
extern crate colored;
extern crate chrono;
extern crate signal_hook;

use std::error::Error;
use std::io::Write;
use std::path::Path;
use std::process::exit;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool,
                        Ordering};
use std::thread;
use std::time::Duration;

use clap::{Args,
           Parser,
           Subcommand};
use clap::error::ErrorKind;
use colored::{ColoredString,
              Colorize};
use log::Level;

use decode_reg_lib::acq::{AcqController,
                          AcqOutcome,
                          AcqParams,
                          TriggerType};
use decode_reg_lib::modules::{simulated_board,
                              ModuleKind};
use decode_reg_lib::sdb::read_sdb;
use decode_reg_lib::{Controller,
                     Decoder,
                     PcieDevice,
                     Settings};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
  /// PCIe slot of the board, e.g. 0000:07:00.0
  /// (default from the config file)
  #[arg(short, long, global = true)]
  slot     : Option<String>,
  /// Settings file (toml). A missing file means
  /// the defaults
  #[arg(short, long, global = true)]
  config   : Option<String>,
  /// Work on a simulated board instead of hardware
  #[arg(long, global = true, default_value_t = false)]
  simulate : bool,
  #[command(subcommand)]
  command  : Command,
}

#[derive(Debug, Subcommand)]
enum Command {
  /// Decode the registers of a core once
  Decode(DecodeOpts),
  /// Decode the registers of a core over and over, until Ctrl-C
  Watch(WatchOpts),
  /// Write parameters of a core
  Write(WriteOpts),
  /// Run an acquisition and print the samples
  Acq(AcqOpts),
  /// List the cores on the self-describing bus
  Sdb,
  /// Write the settings in use to a toml file
  DumpConfig {
    /// file to write
    path : String,
  },
}

#[derive(Debug, Args)]
struct DecodeOpts {
  /// The core, one of acq, pos_calc
  module  : String,
  /// Show the field descriptions
  #[arg(short, long, default_value_t = false)]
  verbose : bool,
  /// Only show this channel
  #[arg(long)]
  channel : Option<usize>,
  /// Print as json
  #[arg(long, default_value_t = false)]
  json    : bool,
  /// Use the n-th core of this kind on the bus
  #[arg(short, long, default_value_t = 0)]
  index   : usize,
}

#[derive(Debug, Args)]
struct WatchOpts {
  #[command(flatten)]
  decode      : DecodeOpts,
  /// Refresh interval (default from the config file)
  #[arg(long)]
  interval_ms : Option<u64>,
}

#[derive(Debug, Args)]
struct WriteOpts {
  /// The core, one of acq, pos_calc
  module : String,
  /// Parameter to write, can be given several times
  #[arg(long = "set", value_name = "NAME=VALUE", required = true)]
  set    : Vec<String>,
  /// Use the n-th core of this kind on the bus
  #[arg(short, long, default_value_t = 0)]
  index  : usize,
}

#[derive(Debug, Args)]
struct AcqOpts {
  /// Channel to acquire
  #[arg(long, default_value_t = 0)]
  channel       : u32,
  /// Samples before the trigger
  #[arg(long, default_value_t = 0)]
  pre           : u32,
  /// Samples after the trigger
  #[arg(long, default_value_t = 1000)]
  post          : u32,
  #[arg(long, default_value_t = 1)]
  shots         : u32,
  /// immediate, external, data-driven or software
  #[arg(long, default_value = "immediate")]
  trigger       : String,
  /// Trigger delay in samples
  #[arg(long)]
  trigger_delay : Option<u32>,
  /// Give up after this (default from the config file)
  #[arg(long)]
  timeout_ms    : Option<u64>,
  /// Sign extend the samples
  #[arg(long, default_value_t = false)]
  signed        : bool,
  /// Data trigger threshold
  #[arg(long, allow_hyphen_values = true)]
  data_thres    : Option<i32>,
  /// Data trigger on the negative edge
  #[arg(long)]
  data_negative : Option<bool>,
  /// Atom of the data trigger channel to compare
  #[arg(long)]
  data_sel      : Option<u32>,
  /// Data trigger hysteresis in samples
  #[arg(long)]
  data_filt     : Option<u32>,
  /// Channel the data trigger looks at
  #[arg(long)]
  data_chan     : Option<u32>,
  /// Print as json
  #[arg(long, default_value_t = false)]
  json          : bool,
  /// Use the n-th acquisition core on the bus
  #[arg(short, long, default_value_t = 0)]
  index         : usize,
}

/// Make sure that the loglevel is in color
fn color_log(level : &Level) -> ColoredString {
  match level {
    Level::Error    => String::from(" ERROR!").red(),
    Level::Warn     => String::from(" WARN  ").yellow(),
    Level::Info     => String::from(" Info  ").green(),
    Level::Debug    => String::from(" debug ").blue(),
    Level::Trace    => String::from(" trace ").cyan(),
  }
}

/// Log to stderr, RUST_LOG controls the level,
/// info if not set
fn init_env_logger() {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .format(|buf, record| {
    writeln!( buf, "[{level}][{module_path}:{line}] {args}",
      level = color_log(&record.level()),
      module_path = record.module_path().unwrap_or("<unknown>"),
      line = record.line().unwrap_or(0),
      args = record.args()
      )
    }).init();
}

fn load_settings(cli : &Cli) -> Result<Settings, Box<dyn Error>> {
  let mut settings = match &cli.config {
    None => Settings::new(),
    Some(path) => {
      if Path::new(path).exists() {
        Settings::from_toml(path)?
      } else {
        warn!("No config file {}, using the defaults", path);
        Settings::new()
      }
    }
  };
  if let Some(slot) = &cli.slot {
    settings.slot = slot.clone();
  }
  Ok(settings)
}

fn open_device(cli : &Cli, settings : &mut Settings) -> Result<PcieDevice, Box<dyn Error>> {
  if cli.simulate {
    info!("Using a simulated board");
    return Ok(simulated_board(settings)?);
  }
  Ok(PcieDevice::open(&settings.slot, settings)?)
}

fn not_found(kind : ModuleKind, index : usize, settings : &Settings) -> Box<dyn Error> {
  format!("No {} core #{} on the bus at {:#x}", kind, index, settings.sdb_root).into()
}

fn open_decoder(device   : &PcieDevice,
                settings : &Settings,
                opts     : &DecodeOpts) -> Result<Box<dyn Decoder>, Box<dyn Error>> {
  let kind = opts.module.parse::<ModuleKind>()?;
  let mut decoder = kind.open_decoder(device, settings, opts.index)?
    .ok_or_else(|| not_found(kind, opts.index, settings))?;
  decoder.set_channel(opts.channel);
  Ok(decoder)
}

fn show(decoder : &dyn Decoder, opts : &DecodeOpts) -> Result<(), Box<dyn Error>> {
  if opts.json {
    println!("{}", serde_json::to_string_pretty(&decoder.to_json()?)?);
  } else {
    let stdout = std::io::stdout();
    decoder.print(&mut stdout.lock(), opts.verbose)?;
  }
  Ok(())
}

fn decode(device : &PcieDevice, settings : &Settings, opts : &DecodeOpts) -> Result<(), Box<dyn Error>> {
  let mut decoder = open_decoder(device, settings, opts)?;
  decoder.get_data()?;
  show(decoder.as_ref(), opts)
}

fn watch(device : &PcieDevice, settings : &Settings, opts : &WatchOpts) -> Result<(), Box<dyn Error>> {
  let mut decoder = open_decoder(device, settings, &opts.decode)?;
  let interval    = Duration::from_millis(opts.interval_ms.unwrap_or(settings.watch_interval_ms));
  let term        = Arc::new(AtomicBool::new(false));
  signal_hook::flag::register(signal_hook::consts::SIGINT,  Arc::clone(&term))?;
  signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;
  while !term.load(Ordering::Relaxed) {
    decoder.get_data()?;
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    if !opts.decode.json {
      println!("{}", format!("==> {} {}", opts.decode.module, now).bold());
    }
    show(decoder.as_ref(), &opts.decode)?;
    thread::sleep(interval);
  }
  info!("Stopped watching");
  Ok(())
}

fn write(device : &PcieDevice, settings : &Settings, opts : &WriteOpts) -> Result<(), Box<dyn Error>> {
  let kind = opts.module.parse::<ModuleKind>()?;
  let mut controller = kind.open_controller(device, settings, opts.index)?
    .ok_or_else(|| not_found(kind, opts.index, settings))?;
  for assignment in &opts.set {
    let (name, value) = assignment.split_once('=')
      .ok_or_else(|| format!("Expected NAME=VALUE, got '{}'", assignment))?;
    controller.set_named(name.trim(), value)?;
  }
  controller.write_params()?;
  println!("{} {} parameter(s) written to {}", "=>".green().bold(), opts.set.len(), kind);
  Ok(())
}

fn acquire(device : PcieDevice, settings : &Settings, opts : &AcqOpts) -> Result<(), Box<dyn Error>> {
  let trigger = opts.trigger.parse::<TriggerType>()?;
  let info    = ModuleKind::Acq.locate(&device, settings, opts.index)?
    .ok_or_else(|| not_found(ModuleKind::Acq, opts.index, settings))?;
  let mut acq = AcqController::new(device, settings);
  acq.set_devinfo(info)?;
  acq.params = AcqParams {
    channel         : Some(opts.channel),
    pre_samples     : Some(opts.pre),
    post_samples    : Some(opts.post),
    shots           : Some(opts.shots),
    trigger         : Some(trigger),
    trigger_delay   : opts.trigger_delay,
    data_trig_thres : opts.data_thres,
    data_trig_pol   : opts.data_negative,
    data_trig_sel   : opts.data_sel,
    data_trig_filt  : opts.data_filt,
    data_trig_chan  : opts.data_chan,
  };
  acq.start_acquisition()?;
  if trigger == TriggerType::Software {
    acq.software_trigger()?;
  }
  let timeout = Duration::from_millis(opts.timeout_ms.unwrap_or(settings.acq_timeout_ms));
  let samples = match acq.result_timeout(opts.signed, timeout)? {
    AcqOutcome::Done(samples) => samples,
    other => {
      acq.abort()?;
      return Err(format!("Acquisition did not finish within {:?} ({:?})", timeout, other).into());
    }
  };
  if opts.json {
    println!("{}", serde_json::to_string(&samples)?);
    return Ok(());
  }
  let atoms  = acq.decoder().channel_desc(opts.channel as usize)?.num_atoms.max(1) as usize;
  let values = samples.to_i64();
  let stdout = std::io::stdout();
  let mut out = stdout.lock();
  for sample in values.chunks(atoms) {
    let line : Vec<String> = sample.iter().map(|v| v.to_string()).collect();
    writeln!(out, "{}", line.join(" "))?;
  }
  Ok(())
}

fn list_sdb(device : &PcieDevice, settings : &Settings) -> Result<(), Box<dyn Error>> {
  let devices = read_sdb(device, settings.sdb_root)?;
  println!("{}", format!("{:<3} {:<20} {:<18} {:<10} {:<5} {}",
                         "#", "name", "vendor", "device", "abi", "address").bold());
  for (k, dev) in devices.iter().enumerate() {
    let known = ModuleKind::ALL.iter().find(|kind| kind.target().matches(&dev.info));
    let line  = format!("{:<3} {:<20} {:#018x} {:#010x} {:>2}.{:<2} {:#x}-{:#x}",
                        k,
                        dev.name,
                        dev.info.vendor_id,
                        dev.info.device_id,
                        dev.info.abi_ver_major,
                        dev.info.abi_ver_minor,
                        dev.info.start_addr,
                        dev.addr_last);
    match known {
      Some(kind) => println!("{} {}", line, format!("[{}]", kind).green()),
      None       => println!("{}", line),
    }
  }
  Ok(())
}

fn run(cli : Cli) -> Result<(), Box<dyn Error>> {
  let mut settings = load_settings(&cli)?;
  if let Command::DumpConfig { path } = &cli.command {
    settings.to_toml(path)?;
    println!("{} Wrote settings to {}", "=>".green().bold(), path);
    return Ok(());
  }
  let device = open_device(&cli, &mut settings)?;
  debug!("{}", settings);
  match &cli.command {
    Command::Decode(opts) => decode(&device, &settings, opts),
    Command::Watch(opts)  => watch(&device, &settings, opts),
    Command::Write(opts)  => write(&device, &settings, opts),
    Command::Acq(opts)    => acquire(device, &settings, opts),
    Command::Sdb          => list_sdb(&device, &settings),
    Command::DumpConfig { .. } => Ok(()),
  }
}

fn main() {
  init_env_logger();
  let cli = match Cli::try_parse() {
    Ok(cli)  => cli,
    Err(err) => {
      let _ = err.print();
      match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit(0),
        _ => exit(1),
      }
    }
  };
  if let Err(err) = run(cli) {
    error!("{}", err);
    eprintln!("{} {}", "=>".red().bold(), err.to_string().red());
    exit(1);
  }
}
