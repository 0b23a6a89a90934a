use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{
    available_ports, ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType,
    StopBits,
};

use super::{PortInfo, PortLister, SerialError, SerialLink, SerialSettings};

/// Port backend using the operating system's serial devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePortLister;

impl PortLister for NativePortLister {
    fn list(&self) -> Result<Vec<PortInfo>, SerialError> {
        let ports = available_ports().map_err(|e| SerialError::Enumerate(e.into()))?;

        Ok(ports
            .into_iter()
            .map(|port| PortInfo {
                name: port.port_name,
                description: match port.port_type {
                    SerialPortType::UsbPort(info) => info.product,
                    _ => None,
                },
            })
            .collect())
    }

    fn open(
        &self,
        port: &str,
        settings: SerialSettings,
    ) -> Result<Box<dyn SerialLink>, SerialError> {
        // On unix the port is opened with TIOCEXCL, so a second process cannot grab it.
        let opened = serialport::new(port, settings.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(settings.timeout)
            .open()
            .map_err(|e| SerialError::Open {
                port: port.to_string(),
                source: e.into(),
            })?;

        Ok(Box::new(NativeLink { port: opened }))
    }
}

struct NativeLink {
    port: Box<dyn SerialPort>,
}

impl Read for NativeLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for NativeLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl SerialLink for NativeLink {
    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(Into::into)
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(Into::into)
    }

    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        let port = self.port.try_clone()?;
        Ok(Box::new(NativeLink { port }))
    }
}
