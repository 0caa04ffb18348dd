//! Linux `/sys/class/gpio` backend.
//!
//! Pull resistors can't be configured through sysfs; they have to be set in
//! the device tree (or are fixed on the board, like GPIO 2/3 on a Pi).

use super::{Gpio, InputLine, Level, OutputLine, Pull};
use crate::consts::Pin;
use anyhow::Context;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

const GPIO_ROOT: &str = "/sys/class/gpio";

pub struct SysfsGpio {
    root: PathBuf,
}

impl SysfsGpio {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from(GPIO_ROOT),
        }
    }

    fn export(&self, pin: Pin, direction: &str) -> anyhow::Result<SysfsLine> {
        let line_dir = self.root.join(format!("gpio{}", pin));
        if !line_dir.exists() {
            match fs::write(self.root.join("export"), pin.to_string()) {
                Ok(()) => {}
                // Already exported by somebody else.
                Err(e) if e.raw_os_error() == Some(16) => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Unable to export GPIO {}", pin));
                }
            }
        }

        // udev needs a moment to fix permissions of freshly exported lines.
        let direction_path = line_dir.join("direction");
        let mut attempt = 0;
        loop {
            match fs::write(&direction_path, direction) {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::PermissionDenied && attempt < 10 => {
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Unable to set GPIO {} direction", pin));
                }
            }
        }
        debug!("GPIO {} exported as {}", pin, direction);

        Ok(SysfsLine {
            pin,
            root: self.root.clone(),
            value: line_dir.join("value"),
        })
    }
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl Gpio for SysfsGpio {
    fn output(&self, pin: Pin) -> anyhow::Result<Box<dyn OutputLine>> {
        Ok(Box::new(self.export(pin, "out")?))
    }

    fn input(&self, pin: Pin, pull: Pull) -> anyhow::Result<Box<dyn InputLine>> {
        debug!("GPIO {}: pull {:?} must be configured outside of sysfs", pin, pull);
        Ok(Box::new(self.export(pin, "in")?))
    }
}

struct SysfsLine {
    pin: Pin,
    root: PathBuf,
    value: PathBuf,
}

impl OutputLine for SysfsLine {
    fn pin(&self) -> Pin {
        self.pin
    }

    fn write(&mut self, level: Level) -> anyhow::Result<()> {
        let raw = if level.is_high() { "1" } else { "0" };
        fs::write(&self.value, raw).with_context(|| format!("Writing GPIO {}", self.pin))
    }
}

impl InputLine for SysfsLine {
    fn pin(&self) -> Pin {
        self.pin
    }

    fn read(&mut self) -> anyhow::Result<Level> {
        let raw = fs::read_to_string(&self.value)
            .with_context(|| format!("Reading GPIO {}", self.pin))?;
        match raw.trim() {
            "0" => Ok(Level::Low),
            "1" => Ok(Level::High),
            other => anyhow::bail!("Unexpected GPIO {} value {:?}", self.pin, other),
        }
    }
}

impl Drop for SysfsLine {
    fn drop(&mut self) {
        if let Err(e) = fs::write(self.root.join("unexport"), self.pin.to_string()) {
            warn!("Unable to unexport GPIO {}: {}", self.pin, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let line = dir.path().join("gpio17");
        fs::create_dir(&line).unwrap();
        fs::write(line.join("direction"), "in").unwrap();
        fs::write(line.join("value"), "0").unwrap();
        dir
    }

    #[test]
    fn output_writes_value_file() {
        let dir = fake_root();
        let gpio = SysfsGpio {
            root: dir.path().to_path_buf(),
        };
        let mut line = gpio.output(17).unwrap();
        line.write(Level::High).unwrap();
        let value = fs::read_to_string(dir.path().join("gpio17/value")).unwrap();
        assert_eq!(value, "1");
        let direction = fs::read_to_string(dir.path().join("gpio17/direction")).unwrap();
        assert_eq!(direction, "out");
    }

    #[test]
    fn input_parses_value_file() {
        let dir = fake_root();
        let gpio = SysfsGpio {
            root: dir.path().to_path_buf(),
        };
        let mut line = gpio.input(17, Pull::Up).unwrap();
        assert_eq!(line.read().unwrap(), Level::Low);
        fs::write(dir.path().join("gpio17/value"), "1\n").unwrap();
        assert_eq!(line.read().unwrap(), Level::High);
    }
}
