use std::time::{Duration, Instant};

use patchbay::{
    basic_units::BuiltinHost,
    driver::{dummy::DummyDriver, AudioDriver},
    node::PortDirection,
    AudioParams, Command, Engine, EngineConfig, EngineError, EventId, Notification, NullResponder,
    Path, PortType,
};

const RUN_DURATION: Duration = Duration::from_secs(2);
const UPDATE_INTERVAL: Duration = Duration::from_millis(15);

fn path(s: &str) -> Path {
    Path::new(s).expect("valid path")
}

fn main() {
    simple_log::quick!("info");

    println!("patchbay render_patch demo...");

    let params = AudioParams::default();
    let (mut engine, processor, mut post) =
        match Engine::new(EngineConfig::default(), params, BuiltinHost::new()) {
            Ok(halves) => halves,
            Err(e) => {
                log::error!("failed to create engine: {}", e);
                return;
            }
        };

    post.set_sink(|n: Notification| match n {
        Notification::Error(e) => log::error!("{}", e),
        Notification::PortValue { path, value } => log::info!("{} = {:.3}", path, value),
        n => log::info!("{:?}", n),
    });

    let commands = [
        Command::create_port(path("/out"), PortType::Audio, PortDirection::Output),
        Command::create_patch(path("/main"), 1),
        Command::create_port(path("/main/out"), PortType::Audio, PortDirection::Output),
        Command::create_node(path("/main/osc"), "gen:osc", false),
        Command::create_node(path("/main/gain"), "fx:gain", false),
        Command::connect(path("/main/osc/out"), path("/main/gain/in")),
        Command::connect(path("/main/gain/out"), path("/main/out")),
        Command::connect(path("/main/out"), path("/out")),
        Command::set_port_value(path("/main/gain/gain"), 0.25),
        Command::set_property(path("/main/gain/out"), "broadcast", true),
    ];

    for command in commands {
        engine.submit(command, 0, |id: EventId, result: Result<(), EngineError>| {
            if let Err(e) = result {
                log::error!("event {} failed: {}", id.get(), e);
            }
        });
    }
    engine.update();

    let mut driver = DummyDriver::new(params, 1);
    let stream = match driver.start(processor) {
        Ok(stream) => stream,
        Err(e) => {
            log::error!("{}", e);
            return;
        }
    };

    let start = Instant::now();
    let mut sweep_hz = 220.0;
    while start.elapsed() < RUN_DURATION {
        std::thread::sleep(UPDATE_INTERVAL);

        sweep_hz *= 1.01;
        engine.submit(
            Command::set_port_value(path("/main/osc/freq"), sweep_hz),
            stream.frames_processed(),
            NullResponder,
        );

        engine.update();
        post.update();
    }

    let frames = stream.frames_processed();
    drop(stream.stop());
    post.update();

    if let Some(order) = engine.process_order(&path("/main")) {
        println!("process order of /main: {:?}", order);
    }
    println!("finished after {} frames", frames);
}
