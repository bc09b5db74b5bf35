//! Serial port transport implementation

use super::{
    BusTransport, ChannelConfig, ControlLine, DirectionState, SerialParity, TransportError,
    TransportStats,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialStream, StopBits};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 256;
const MAX_FLUSH_READS: usize = 64;

/// Serial port transport with optional RTS/DTR direction control
pub struct SerialTransport {
    config: ChannelConfig,
    stream: SerialStream,
    direction: DirectionState,
    stats: TransportStats,
}

impl SerialTransport {
    /// Open the port and put the transceiver into receive
    pub fn open(config: ChannelConfig) -> Result<Self, TransportError> {
        config.validate()?;

        let data_bits = match config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let builder = tokio_serial::new(config.port.as_str(), config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(FlowControl::None);

        let stream = SerialStream::open(&builder).map_err(|e| match e.kind() {
            tokio_serial::ErrorKind::NoDevice => TransportError::PortNotFound(config.port.clone()),
            tokio_serial::ErrorKind::InvalidInput => TransportError::Configuration(e.to_string()),
            tokio_serial::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                TransportError::PermissionDenied(config.port.clone())
            }
            tokio_serial::ErrorKind::Io(io::ErrorKind::NotFound) => {
                TransportError::PortNotFound(config.port.clone())
            }
            _ => TransportError::Io(e.into()),
        })?;

        let mut transport = Self {
            config,
            stream,
            direction: DirectionState::Receive,
            stats: TransportStats::default(),
        };
        transport.drive_line(DirectionState::Receive)?;

        info!(channel = %transport.config.describe(), "serial port opened");
        Ok(transport)
    }

    /// Time to shift one character out at the configured framing
    fn character_time(&self) -> Duration {
        let bits = u64::from(self.config.bits_per_character());
        Duration::from_nanos(bits * 1_000_000_000 / u64::from(self.config.baud_rate))
    }

    fn drive_line(&mut self, state: DirectionState) -> Result<(), TransportError> {
        if let Some(control) = self.config.direction {
            let level = control.level_for(state);
            match control.line {
                ControlLine::Rts => self.stream.write_request_to_send(level),
                ControlLine::Dtr => self.stream.write_data_terminal_ready(level),
            }
            .map_err(|e| TransportError::Io(e.into()))?;
        }
        Ok(())
    }

    async fn read_chunk(&mut self, timeout: Duration) -> Result<Bytes, TransportError> {
        let mut buffer = [0u8; READ_CHUNK];
        match tokio::time::timeout(timeout, self.stream.read(&mut buffer)).await {
            Err(_) => Ok(Bytes::new()),
            Ok(Ok(0)) => Err(TransportError::Disconnected),
            Ok(Ok(n)) => Ok(Bytes::copy_from_slice(&buffer[..n])),
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => Ok(Bytes::new()),
            Ok(Err(e)) => Err(TransportError::Io(e)),
        }
    }
}

#[async_trait]
impl BusTransport for SerialTransport {
    fn channel(&self) -> ChannelConfig {
        self.config.clone()
    }

    async fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(data).await?;
        self.stats.bytes_sent += data.len() as u64;
        self.stats.writes += 1;
        Ok(())
    }

    async fn wait_for_transmit_complete(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let char_time = self.character_time();
        let stream = &mut self.stream;
        let drained = tokio::time::timeout(timeout, async move {
            stream.flush().await?;
            while stream.bytes_to_write().map_err(io::Error::from)? > 0 {
                tokio::time::sleep(char_time).await;
            }
            // The last character may still be in the shift register
            tokio::time::sleep(char_time).await;
            Ok::<(), io::Error>(())
        })
        .await;

        match drained {
            Ok(result) => result.map_err(TransportError::Io),
            Err(_) => Err(TransportError::TransmitTimeout(timeout)),
        }
    }

    async fn read_available(&mut self, timeout: Duration) -> Result<Bytes, TransportError> {
        let chunk = self.read_chunk(timeout).await?;
        self.stats.bytes_received += chunk.len() as u64;
        Ok(chunk)
    }

    fn set_direction(&mut self, state: DirectionState) -> Result<(), TransportError> {
        self.drive_line(state)?;
        if self.direction != state {
            self.stats.direction_switches += 1;
        }
        self.direction = state;
        Ok(())
    }

    fn direction(&self) -> DirectionState {
        self.direction
    }

    async fn flush_input(&mut self, grace: Duration) -> Result<usize, TransportError> {
        self.stream
            .clear(ClearBuffer::Input)
            .map_err(|e| TransportError::Io(e.into()))?;

        let mut discarded = 0;
        for _ in 0..MAX_FLUSH_READS {
            let chunk = self.read_chunk(grace).await?;
            if chunk.is_empty() {
                break;
            }
            discarded += chunk.len();
        }

        if discarded > 0 {
            debug!(port = %self.config.port, discarded, "discarded stale input");
        }
        self.stats.bytes_flushed += discarded as u64;
        Ok(discarded)
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if self.direction != DirectionState::Receive {
            if let Err(e) = self.drive_line(DirectionState::Receive) {
                warn!(port = %self.config.port, error = %e, "could not release direction line");
            }
        }
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<tokio_serial::SerialPortInfo>, TransportError> {
    tokio_serial::available_ports().map_err(|e| TransportError::Io(e.into()))
}
