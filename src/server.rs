/// Line-oriented TCP server exposing the sensor readings. Each connected
/// client gets one `TELEMETRY ...` line per tick and may send commands
/// back; everything runs on the single thread that drives the dongle, so
/// the sockets are non-blocking and serviced cooperatively.
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use log::{debug, info, warn};

use crate::ant::Ant;
use crate::channel::ChannelState;
use crate::device::fec::FitnessEquipmentControl;
use crate::device::hrm::HeartRateMonitor;
use crate::device::Profile;
use crate::usb::Transport;
use crate::Result;

pub const DEFAULT_PORT: u16 = 7500;

/// A "current" reading from the trainer. Quoted because the values come
/// from different sensors and are not perfectly in sync. Negative means no
/// reading; the field is left out of the telemetry line.
#[derive(Clone, Copy, Debug)]
pub struct Telemetry {
    pub hr: f64,
    pub cad: f64,
    pub spd: f64,
    pub pwr: f64,
}

impl Default for Telemetry {
    fn default() -> Self {
        Telemetry {
            hr: -1.0,
            cad: -1.0,
            spd: -1.0,
            pwr: -1.0,
        }
    }
}

impl fmt::Display for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hr >= 0.0 {
            write!(f, "HR: {}", self.hr)?;
        }
        if self.cad >= 0.0 {
            write!(f, ";CAD: {}", self.cad)?;
        }
        if self.pwr >= 0.0 {
            write!(f, ";PWR: {}", self.pwr)?;
        }
        if self.spd >= 0.0 {
            write!(f, ";SPD: {}", self.spd)?;
        }
        Ok(())
    }
}

/// Parse a client command line. The only recognized command is
/// `SET-SLOPE <percent>`; anything else is ignored.
fn parse_set_slope(line: &str) -> Option<f64> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "SET-SLOPE" {
        return None;
    }
    parts.next()?.parse().ok()
}

struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    line: Vec<u8>,
}

impl Client {
    /// Push this tick's telemetry line and drain whatever the client sent.
    /// Completed command lines are appended to `commands`. Returns false
    /// once the connection is gone.
    fn service(&mut self, line: &[u8], commands: &mut Vec<String>) -> bool {
        match self.stream.write(line) {
            Ok(_) => {}
            // Not ready this tick; it will get the next line instead.
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!("{}: {}", self.peer, e);
                return false;
            }
        }

        let mut buf = [0u8; 256];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return false,
                Ok(n) => {
                    for &b in &buf[..n] {
                        if b == b'\n' {
                            commands.push(String::from_utf8_lossy(&self.line).into_owned());
                            self.line.clear();
                        } else {
                            self.line.push(b);
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("{}: {}", self.peer, e);
                    return false;
                }
            }
        }
    }
}

/// Owns the dongle controller and one channel per supported sensor,
/// bridging them to TCP clients.
pub struct TelemetryServer<T: Transport> {
    ant: Ant<T>,
    listener: TcpListener,
    clients: Vec<Client>,
    hrm_channel: u8,
    fec_channel: u8,
}

impl<T: Transport> TelemetryServer<T> {
    /// Start listening and open the two sensor channels, searching for any
    /// device in range. `ant` must already have its network key installed.
    pub fn new(mut ant: Ant<T>, port: u16) -> Result<TelemetryServer<T>> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        info!("started server on port {}", port);

        let hrm_channel = ant.open_channel(
            HeartRateMonitor::channel_config(0),
            Profile::HeartRateMonitor(HeartRateMonitor::new()),
        )?;
        let fec_channel = ant.open_channel(
            FitnessEquipmentControl::channel_config(0),
            Profile::Fec(FitnessEquipmentControl::new()),
        )?;

        Ok(TelemetryServer {
            ant,
            listener,
            clients: Vec::new(),
            hrm_channel,
            fec_channel,
        })
    }

    /// One iteration of the bridge: drive the dongle, rebuild dropped
    /// sensor channels, and service the clients.
    pub fn tick(&mut self) -> Result<()> {
        self.ant.tick()?;
        self.check_sensor_health()?;
        let telemetry = self.collect_telemetry();
        self.process_clients(&telemetry);
        Ok(())
    }

    /// A channel that reached CLOSED is rebuilt with the device number it
    /// had learned, so the session sticks to the same physical sensors.
    fn check_sensor_health(&mut self) -> Result<()> {
        if let Some(device_number) = self.closed_device_number(self.hrm_channel) {
            info!("re-creating HRM channel for device {}", device_number);
            self.ant.release_channel(self.hrm_channel);
            self.hrm_channel = self.ant.open_channel(
                HeartRateMonitor::channel_config(device_number),
                Profile::HeartRateMonitor(HeartRateMonitor::new()),
            )?;
        }
        if let Some(device_number) = self.closed_device_number(self.fec_channel) {
            info!("re-creating FE-C channel for device {}", device_number);
            self.ant.release_channel(self.fec_channel);
            self.fec_channel = self.ant.open_channel(
                FitnessEquipmentControl::channel_config(device_number),
                Profile::Fec(FitnessEquipmentControl::new()),
            )?;
        }
        Ok(())
    }

    fn closed_device_number(&self, number: u8) -> Option<u32> {
        let channel = self.ant.channel(number)?;
        if channel.state() == ChannelState::Closed {
            Some(channel.id().device_number)
        } else {
            None
        }
    }

    fn collect_telemetry(&self) -> Telemetry {
        let mut telemetry = Telemetry::default();
        if let Some(channel) = self.ant.channel(self.hrm_channel) {
            if channel.state() == ChannelState::Open {
                if let Profile::HeartRateMonitor(hrm) = channel.profile() {
                    telemetry.hr = hrm.instant_heart_rate() as f64;
                }
            }
        }
        if let Some(channel) = self.ant.channel(self.fec_channel) {
            if channel.state() == ChannelState::Open {
                if let Profile::Fec(fec) = channel.profile() {
                    telemetry.cad = fec.instant_cadence() as f64;
                    telemetry.pwr = fec.instant_power() as f64;
                    telemetry.spd = fec.instant_speed();
                }
            }
        }
        telemetry
    }

    fn process_clients(&mut self, telemetry: &Telemetry) {
        self.accept_clients();

        let line = format!("TELEMETRY {}\n", telemetry);
        let mut commands = Vec::new();
        self.clients.retain_mut(|client| {
            let keep = client.service(line.as_bytes(), &mut commands);
            if !keep {
                info!("closing connection to {}", client.peer);
            }
            keep
        });

        for command in commands {
            if let Some(slope) = parse_set_slope(&command) {
                if let Some(channel) = self.ant.channel_mut(self.fec_channel) {
                    channel.set_slope(slope);
                }
            }
        }
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("{}: {}", peer, e);
                        continue;
                    }
                    info!("accepted connection from {}", peer);
                    self.clients.push(Client {
                        stream,
                        peer,
                        line: Vec::new(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }
}
