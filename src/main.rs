use std::process::exit;
use std::thread;
use std::time::Duration;

use log::error;

use antbridge::{
    Ant, AntError, Context, Result, TelemetryServer, UsbTransport, ANT_PLUS_NETWORK_KEY,
    DEFAULT_PORT,
};

fn run(ctx: &Context) -> Result<()> {
    let transport = UsbTransport::open(ctx)?;
    let mut ant = Ant::init(transport)?;
    ant.set_network_key(&ANT_PLUS_NETWORK_KEY)?;
    let mut server = TelemetryServer::new(ant, DEFAULT_PORT)?;
    loop {
        server.tick()?;
    }
}

fn main() {
    env_logger::init();

    // Creating the context initializes the USB library process-wide; doing
    // it once up front keeps it alive for every reconnect below.
    let ctx = match Context::new() {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("failed to initialize USB: {}", e);
            exit(1);
        }
    };

    loop {
        match run(&ctx) {
            Err(AntError::DeviceNotFound) => {
                error!("no ANT+ USB stick found");
                exit(1);
            }
            Err(e) => {
                // The stick may have been unplugged or wedged; give it a
                // moment and reopen it.
                error!("{}", e);
                thread::sleep(Duration::from_millis(1000));
            }
            Ok(()) => {}
        }
    }
}
