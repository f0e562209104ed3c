//! Serial consoles.

use std::time::Duration;

use log::{debug, info, warn};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

/// Delay between two attempts at opening a console port.
const OPEN_RETRY_DELAY_MS: u64 = 1000;
const OPEN_RETRIES: usize = 4;

/// Open the console port at `path`, 8N1 without flow control, retrying while
/// the device is busy or not there yet.
pub(crate) fn open_and_setup_port(
    path: &str,
    baud_rate: u32,
) -> Result<Box<dyn SerialPort>, serialport::Error> {
    use retry::{delay, retry_with_index};

    let opened = retry_with_index(
        delay::Fixed::from_millis(OPEN_RETRY_DELAY_MS).take(OPEN_RETRIES),
        |attempt| {
            debug!("Opening console {} (attempt {})", path, attempt);
            serialport::new(path, baud_rate)
                .timeout(Duration::from_millis(100))
                .open()
        },
    );
    let mut port = match opened {
        Ok(port) => port,
        Err(retry::Error::Operation {
            error,
            total_delay,
            tries,
        }) => {
            warn!(
                "Giving up on console {} after {} tries in {:?}: {}",
                path, tries, total_delay, error
            );
            return Err(error);
        }
        Err(retry::Error::Internal(msg)) => {
            return Err(serialport::Error::new(serialport::ErrorKind::Unknown, msg));
        }
    };

    configure_8n1(port.as_mut(), baud_rate)?;
    let actual = port.baud_rate()?;
    if actual != baud_rate {
        return Err(serialport::Error::new(
            serialport::ErrorKind::InvalidInput,
            format!("{} runs at {} baud instead of {}", path, actual, baud_rate),
        ));
    }
    info!("Console {} open at {} baud", path, actual);
    Ok(port)
}

/// Some drivers ignore the settings given at `open`, they are applied again
/// on the open port.
fn configure_8n1(port: &mut dyn SerialPort, baud_rate: u32) -> Result<(), serialport::Error> {
    port.set_baud_rate(baud_rate)?;
    port.set_data_bits(DataBits::Eight)?;
    port.set_stop_bits(StopBits::One)?;
    port.set_parity(Parity::None)?;
    port.set_flow_control(FlowControl::None)
}
