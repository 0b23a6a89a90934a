use colored::Colorize;
use dw_link::discovery::is_bogus_port;
use dw_link::serial::{Lister, PortInfo};

#[derive(Debug, clap::Parser)]
pub struct Cmd {}

impl Cmd {
    pub fn run(self, lister: &Lister) -> anyhow::Result<()> {
        let ports = lister.list().map_err(dw_link::Error::from)?;

        if ports.is_empty() {
            println!("No serial ports were found.");
            return Ok(());
        }

        println!("The following serial ports were found:");
        for (num, port) in ports.iter().enumerate() {
            println!("[{num}]: {}", describe(port));
        }
        Ok(())
    }
}

fn describe(port: &PortInfo) -> String {
    let mut line = port.name.clone();
    if let Some(description) = &port.description {
        line.push_str(&format!(" ({description})"));
    }
    if is_bogus_port(&port.name) {
        line.push_str(&format!(" {}", "[not probed]".dimmed()));
    }
    line
}
