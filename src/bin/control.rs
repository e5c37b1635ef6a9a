use clap::{Parser, Subcommand};
use intelliflo::{
    control::Control,
    frame::Address,
    scheduler::{Config, Scheduler, Tick},
    serial::{self, TokioClock},
    telemetry::CommandResult,
};
use std::{cell::Cell, error::Error, rc::Rc};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pump number (1 to 16)
    #[arg(short = 'n', long, default_value_t = 1)]
    pump: u8,

    /// Serial port path
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    port: String,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Start the motor
    Start,
    /// Stop the motor
    Stop,
    /// Select a local program
    Program { program: u8 },
    /// Select an external program (0 stops external control)
    External { program: u8 },
    /// Take over control from the pump's panel
    Remote,
    /// Return control to the pump's panel
    Local,
    /// Set the target speed in rpm
    Speed { rpm: u16 },
    /// Set the target flow in tenths of m³/h
    Flow { flow: u8 },
    /// Store a speed value for an external program
    Save { program: u8, value: u16 },
}

impl From<Action> for Control {
    fn from(action: Action) -> Self {
        match action {
            Action::Start => Self::SetRunning(true),
            Action::Stop => Self::SetRunning(false),
            Action::Program { program } => Self::SetProgram(program),
            Action::External { program } => Self::SetExternalProgram(program),
            Action::Remote => Self::SetRemoteControl(true),
            Action::Local => Self::SetRemoteControl(false),
            Action::Speed { rpm } => Self::SetSpeed(rpm),
            Action::Flow { flow } => Self::SetFlow(flow),
            Action::Save { program, value } => Self::SaveProgramValue { program, value },
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let pump = Address::pump(args.pump).ok_or("Pump number out of range")?;
    let port = serial::open(&args.port)?;
    let mut sched = Scheduler::new(port, TokioClock::new(), &[pump], Config::default())?;
    let result = Rc::new(Cell::new(None));
    let report = result.clone();

    sched
        .telemetry()
        .register_command_observer(pump, move |rep| report.set(Some(rep.result)));

    let switch = sched.register_switch_controller(pump)?;
    let id = switch.request(args.action.into())?;

    println!("Sending command {id} to pump {pump}");

    // Dispatch the command and wait for its report
    while result.get().is_none() {
        if let Tick::Idle(_) = sched.tick().await? {
            break;
        }
    }

    match result.get() {
        Some(CommandResult::Completed) => {
            println!("Command completed");

            Ok(())
        }
        Some(res) => Err(format!("Command {res}").into()),
        None => Err("Command was not dispatched".into()),
    }
}
