//! Pi-cam-control binary: runs the camera controller from a terminal.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::Receiver;
use serde::de::value::{Error as ValueError, StrDeserializer};
use serde::de::IntoDeserializer;
use serde::Deserialize;
use tracing::{debug, info, warn};

use pi_cam_control::control::TimelapseEnd;
use pi_cam_control::export::{self, ExportSections, StillSection};
use pi_cam_control::settings::{
    CameraSettings, ExposureMode, MeteringMode, TimelapseLimit, TimelapseSettings,
};
use pi_cam_control::{
    control_channel, AppConfig, Command, ControlHandle, ControllerOptions, ModeController,
    Pipeline, StatusEvent, V4L2Backend,
};

#[derive(Parser)]
#[command(name = "pi-cam-control")]
#[command(about = "Preview, still capture and timelapse for V4L2 cameras")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the camera and read commands from stdin
    Run {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Camera device index, overriding the config file
        #[arg(short, long)]
        device: Option<u32>,

        /// Start with the preview hidden
        #[arg(long)]
        no_preview: bool,
    },
    /// Write the settings as a libcamera-apps config file
    Export {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Destination file
        #[arg(short, long)]
        output: PathBuf,

        /// Include preview placement
        #[arg(long)]
        preview: bool,

        /// Include the sensor crop
        #[arg(long)]
        zoom: bool,

        /// Include libcamera-still settings
        #[arg(long, value_enum)]
        still: Option<StillArg>,

        /// Header comment
        #[arg(long)]
        comment: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StillArg {
    Timelapse,
    Capture,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pi_cam_control=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        None => run(None, None, false),
        Some(Commands::Run {
            config,
            device,
            no_preview,
        }) => run(config.as_deref(), device, no_preview),
        Some(Commands::Export {
            config,
            output,
            preview,
            zoom,
            still,
            comment,
        }) => {
            let config = load_config(config.as_deref())?;
            let sections = ExportSections {
                preview,
                zoom,
                still: still.map(|still| match still {
                    StillArg::Timelapse => StillSection::Timelapse,
                    StillArg::Capture => StillSection::Capture,
                }),
            };
            export::export_to_path(&output, &config, sections, comment.as_deref())?;
            println!("Settings written to {}", output.display());
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => {
            let config = AppConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn run(config: Option<&Path>, device: Option<u32>, no_preview: bool) -> anyhow::Result<()> {
    let mut config = load_config(config)?;
    if let Some(device) = device {
        config.device = device;
    }
    if no_preview {
        config.preview.enabled = false;
    }

    let backend = V4L2Backend::new(config.device, config.buffer_count);
    let quit = backend.quit_handle();
    let ctrlc_quit = Arc::clone(&quit);
    ctrlc::set_handler(move || {
        ctrlc_quit.store(true, Ordering::SeqCst);
    })?;

    let (handle, link) = control_channel(16);
    let options = ControllerOptions::from(&config);
    let camera = thread::Builder::new()
        .name("camera".to_owned())
        .spawn(move || ModeController::new(Pipeline::new(backend), link, options).run())?;

    let status = handle.status_receiver();
    let printer = thread::Builder::new()
        .name("status".to_owned())
        .spawn(move || print_statuses(&status, &mut std::io::stderr()))?;

    let commands = handle;
    let timelapse = config.timelapse.clone();
    let camera_settings = config.camera.clone();
    thread::Builder::new()
        .name("stdin".to_owned())
        .spawn(move || {
            read_commands(
                std::io::stdin().lock(),
                &commands,
                camera_settings,
                &timelapse,
                &quit,
            );
        })?;

    eprintln!("Camera {} running. Type `help` for commands.", config.device);
    camera
        .join()
        .map_err(|_| anyhow!("camera thread panicked"))??;
    info!("camera stopped");

    // The status stream ends once the controller's link is dropped.
    printer
        .join()
        .map_err(|_| anyhow!("status thread panicked"))?;
    Ok(())
}

const HELP: &str = "\
commands:
  capture                      take a still image
  timelapse [STEP_MS [FRAMES]] start a timelapse
  cancel                       stop the timelapse
  preview on|off               show or hide the preview
  hflip | vflip                toggle a flip
  set KEY VALUE                brightness contrast saturation sharpness ev gain
                               zoom pan_h pan_v exposure metering
  quit";

/// Print status events until the controller drops its end of the channel.
fn print_statuses<W: Write>(status: &Receiver<StatusEvent>, out: &mut W) {
    for event in status {
        if writeln!(out, "{}", describe(&event)).is_err() {
            return;
        }
    }
}

fn read_commands<R: BufRead>(
    input: R,
    handle: &ControlHandle,
    mut camera: CameraSettings,
    timelapse: &TimelapseSettings,
    quit: &AtomicBool,
) {
    for line in input.lines() {
        let Ok(line) = line else {
            break;
        };
        match parse_line(&line, &mut camera, timelapse) {
            Ok(None) => {}
            Ok(Some(Input::Quit)) => {
                quit.store(true, Ordering::SeqCst);
                return;
            }
            Ok(Some(Input::Command(command))) => {
                if let Err(err) = handle.send(command) {
                    warn!(%err, "command not delivered");
                }
            }
            Err(message) => eprintln!("{message}"),
        }
    }
    // No terminal attached; keep running until Ctrl-C.
    debug!("stdin closed, commands disabled");
}

/// One parsed line of terminal input.
#[derive(Debug, PartialEq)]
enum Input {
    Command(Command),
    Quit,
}

/// Parse a terminal command. `camera` holds the settings last sent, and is
/// updated by `set`, `hflip` and `vflip`.
fn parse_line(
    line: &str,
    camera: &mut CameraSettings,
    timelapse: &TimelapseSettings,
) -> Result<Option<Input>, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let command = match words.as_slice() {
        [] => return Ok(None),
        ["quit" | "exit" | "q"] => return Ok(Some(Input::Quit)),
        ["help" | "?"] => return Err(HELP.to_owned()),
        ["capture" | "c"] => Command::RequestCapture,
        ["cancel"] => Command::CancelTimelapse,
        ["preview", "on"] => Command::SetPreview(true),
        ["preview", "off"] => Command::SetPreview(false),
        ["timelapse", args @ ..] if args.len() <= 2 => {
            let mut settings = timelapse.clone();
            if let Some(step) = args.first() {
                let step: u64 = parse_number(step)?;
                if step == 0 {
                    return Err("timelapse step must be positive".to_owned());
                }
                settings.step = Duration::from_millis(step);
            }
            if let Some(frames) = args.get(1) {
                settings.limit = TimelapseLimit::Frames(parse_number(frames)?);
            }
            Command::RequestTimelapse(settings)
        }
        ["hflip"] => {
            camera.hflip = !camera.hflip;
            Command::UpdateSettings(camera.clone())
        }
        ["vflip"] => {
            camera.vflip = !camera.vflip;
            Command::UpdateSettings(camera.clone())
        }
        ["set", key, value] => {
            let mut updated = camera.clone();
            apply_setting(&mut updated, key, value)?;
            if !updated.zoom.is_valid() {
                return Err(format!("{key}={value} moves the crop outside the frame"));
            }
            *camera = updated;
            Command::UpdateSettings(camera.clone())
        }
        _ => return Err(format!("unknown command `{line}`, try `help`")),
    };
    Ok(Some(Input::Command(command)))
}

fn apply_setting(camera: &mut CameraSettings, key: &str, value: &str) -> Result<(), String> {
    match key {
        "brightness" => {
            let brightness = parse_number(value)?;
            if !(-1.0..=1.0).contains(&brightness) {
                return Err("brightness must be within -1.0..=1.0".to_owned());
            }
            camera.brightness = brightness;
        }
        "contrast" => camera.contrast = parse_number(value)?,
        "saturation" => camera.saturation = parse_number(value)?,
        "sharpness" => camera.sharpness = parse_number(value)?,
        "ev" => camera.ev = parse_number(value)?,
        "gain" | "analoggain" => camera.analog_gain = parse_number(value)?,
        "zoom" => camera.zoom.zoom = parse_number(value)?,
        "pan_h" => camera.zoom.pan_h = parse_number(value)?,
        "pan_v" => camera.zoom.pan_v = parse_number(value)?,
        "exposure" => camera.exposure = parse_name::<ExposureMode>(value)?,
        "metering" => camera.metering = parse_name::<MeteringMode>(value)?,
        _ => return Err(format!("unknown setting `{key}`")),
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("`{value}` is not a valid number"))
}

/// Parse a mode name the same way the config file does.
fn parse_name<'de, T: Deserialize<'de>>(value: &'de str) -> Result<T, String> {
    let deserializer: StrDeserializer<'de, ValueError> = value.into_deserializer();
    T::deserialize(deserializer).map_err(|err| err.to_string())
}

fn describe(event: &StatusEvent) -> String {
    match event {
        StatusEvent::ImageSaved { path, origin } => {
            format!("saved {} ({origin:?})", path.display())
        }
        StatusEvent::SaveFailed {
            path,
            origin,
            reason,
        } => format!("{origin:?} capture {} not saved: {reason}", path.display()),
        StatusEvent::TimelapseComplete(summary) => match summary.reason {
            TimelapseEnd::LimitReached => {
                format!("timelapse complete, {} frames", summary.frames_captured)
            }
            TimelapseEnd::Cancelled => format!(
                "timelapse cancelled after {} of {} frames",
                summary.frames_captured, summary.frame_limit
            ),
        },
        StatusEvent::RecordingStopped(stats) => {
            format!("recording finished, {} frames written", stats.frames_written)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<Option<Input>, String> {
        parse_line(
            line,
            &mut CameraSettings::default(),
            &TimelapseSettings::default(),
        )
    }

    #[test]
    fn test_end_of_input_keeps_camera_running() {
        let (handle, _link) = control_channel(4);
        let quit = AtomicBool::new(false);
        read_commands(
            "capture\n".as_bytes(),
            &handle,
            CameraSettings::default(),
            &TimelapseSettings::default(),
            &quit,
        );
        assert!(!quit.load(Ordering::SeqCst));
    }

    #[test]
    fn test_quit_command_sets_flag() {
        let (handle, _link) = control_channel(1);
        let quit = AtomicBool::new(false);
        read_commands(
            "bogus\nquit\ncapture\n".as_bytes(),
            &handle,
            CameraSettings::default(),
            &TimelapseSettings::default(),
            &quit,
        );
        assert!(quit.load(Ordering::SeqCst));
        // The single queue slot is still free, so nothing after `quit` was sent.
        assert_eq!(handle.send(Command::RequestCapture), Ok(()));
    }

    #[test]
    fn test_status_printer_drains_then_stops() {
        use pi_cam_control::save::CaptureOrigin;

        let (sender, status) = crossbeam_channel::unbounded();
        let printer = thread::spawn(move || {
            let mut out = Vec::new();
            print_statuses(&status, &mut out);
            out
        });
        sender
            .send(StatusEvent::ImageSaved {
                path: PathBuf::from("/captures/0307140509.jpg"),
                origin: CaptureOrigin::Still,
            })
            .expect("send failed");
        drop(sender);

        let out = printer.join().expect("printer panicked");
        let text = String::from_utf8(out).expect("utf8 output");
        assert_eq!(text, "saved /captures/0307140509.jpg (Still)\n");
    }

    #[test]
    fn test_blank_line_is_ignored() {
        assert_eq!(parse("   "), Ok(None));
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(
            parse("capture"),
            Ok(Some(Input::Command(Command::RequestCapture)))
        );
        assert_eq!(
            parse("preview off"),
            Ok(Some(Input::Command(Command::SetPreview(false))))
        );
        assert_eq!(parse("quit"), Ok(Some(Input::Quit)));
        assert!(parse("preview maybe").is_err());
    }

    #[test]
    fn test_timelapse_arguments() {
        let Ok(Some(Input::Command(Command::RequestTimelapse(settings)))) =
            parse("timelapse 2000 15")
        else {
            unreachable!("expected a timelapse request");
        };
        assert_eq!(settings.step, Duration::from_millis(2000));
        assert_eq!(settings.limit, TimelapseLimit::Frames(15));

        assert!(parse("timelapse 0").is_err());
        assert!(parse("timelapse soon").is_err());
    }

    #[test]
    fn test_settings_accumulate() {
        let mut camera = CameraSettings::default();
        let timelapse = TimelapseSettings::default();
        parse_line("set brightness 0.5", &mut camera, &timelapse).expect("set failed");
        let Ok(Some(Input::Command(Command::UpdateSettings(sent)))) =
            parse_line("hflip", &mut camera, &timelapse)
        else {
            unreachable!("expected a settings update");
        };
        assert!(sent.hflip);
        assert!((sent.brightness - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_mode_names() {
        let mut camera = CameraSettings::default();
        let timelapse = TimelapseSettings::default();
        parse_line("set exposure long", &mut camera, &timelapse).expect("set failed");
        parse_line("set metering matrix", &mut camera, &timelapse).expect("set failed");
        assert_eq!(camera.exposure, ExposureMode::Long);
        assert_eq!(camera.metering, MeteringMode::Matrix);
        assert!(parse_line("set exposure dusk", &mut camera, &timelapse).is_err());
    }

    #[test]
    fn test_invalid_pan_is_rejected() {
        let mut camera = CameraSettings::default();
        let timelapse = TimelapseSettings::default();
        assert!(parse_line("set pan_h 0.2", &mut camera, &timelapse).is_err());
        assert!(camera.zoom.pan_h.abs() < 1e-9);
        parse_line("set zoom 0.5", &mut camera, &timelapse).expect("zoom failed");
        parse_line("set pan_h 0.2", &mut camera, &timelapse).expect("pan failed");
        assert!((camera.zoom.pan_h - 0.2).abs() < 1e-9);
    }
}
