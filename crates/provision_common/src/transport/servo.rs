//! Servo-mediated access.
//!
//! A servo host runs `servod` for the attached DUT. Firmware is flashed from
//! the servo host through the debug adapter, and the DUT is powered through
//! `dut-control`.

use std::fmt;

use async_trait::async_trait;
use tracing::info;

use super::DeviceConnection;
use crate::error::{ProvisionError, Result};

/// Servo type string reported by servod, e.g. `servo_v4p1_with_servo_micro`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServoType(String);

const CCD_MARKERS: [&str; 3] = ["ccd_cr50", "ccd_ti50", "ccd_gsc"];

impl ServoType {
    pub fn new(s: &str) -> Self {
        Self(s.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_v2(&self) -> bool {
        self.0.starts_with("servo_v2")
    }

    pub fn is_ccd(&self) -> bool {
        CCD_MARKERS.iter().any(|m| self.0.contains(m))
    }

    pub fn is_c2d2(&self) -> bool {
        self.0.contains("c2d2")
    }

    pub fn is_micro(&self) -> bool {
        self.0.contains("servo_micro")
    }

    /// Dual setups such as `servo_v4p1_with_servo_micro_and_ccd_cr50`.
    pub fn is_multiple(&self) -> bool {
        self.0.contains("_and_")
    }

    /// Pick one adapter of a dual setup.
    ///
    /// `servo_v4p1_with_servo_micro_and_ccd_cr50` becomes
    /// `servo_v4p1_with_ccd_cr50` when CCD is preferred, otherwise
    /// `servo_v4p1_with_servo_micro`.
    pub fn pick_subtype(&self, prefer_ccd: bool) -> ServoType {
        let Some((first, second)) = self.0.split_once("_and_") else {
            return self.clone();
        };
        if !prefer_ccd {
            return ServoType::new(first);
        }
        match first.split_once("_with_") {
            Some((base, _)) => ServoType::new(&format!("{}_with_{}", base, second)),
            None => ServoType::new(second),
        }
    }

    /// servod variable holding the serial number of this adapter.
    pub fn serial_number_option(&self) -> &'static str {
        if self.is_micro() {
            "servo_micro_serialname"
        } else if self.is_c2d2() {
            "c2d2_serialname"
        } else if self.is_ccd() {
            "ccd_serialname"
        } else {
            "serialname"
        }
    }
}

impl fmt::Display for ServoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How to flash AP firmware through a given adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServoConfig {
    pub servo_type: ServoType,
    /// futility `-p` argument
    pub programmer: String,
    /// dut-control commands before flashing
    pub dut_on: Vec<Vec<String>>,
    /// dut-control commands after flashing, run even if flashing failed
    pub dut_off: Vec<Vec<String>>,
    /// Extra futility arguments
    pub extra_args: Vec<String>,
}

fn controls(list: &[&[&str]]) -> Vec<Vec<String>> {
    list.iter()
        .map(|cmd| cmd.iter().map(|s| s.to_string()).collect())
        .collect()
}

impl ServoConfig {
    pub fn new(servo_type: &ServoType, serial: &str) -> Result<Self> {
        let (programmer, dut_on, dut_off) = if servo_type.is_ccd() && !servo_type.is_micro() {
            (
                format!("raiden_debug_spi:target=AP,serial={}", serial),
                vec![],
                vec![],
            )
        } else if servo_type.is_micro() || servo_type.is_c2d2() {
            (
                format!("raiden_debug_spi:serial={}", serial),
                controls(&[&["cpu_fw_spi:on"]]),
                controls(&[&["cpu_fw_spi:off"]]),
            )
        } else if servo_type.is_v2() {
            (
                format!("ft2232_spi:type=google-servo-v2,serial={}", serial),
                controls(&[&["spi2_vref:pp3300"], &["spi2_buf_en:on"], &["cold_reset:on"]]),
                controls(&[&["spi2_vref:off"], &["spi2_buf_en:off"], &["cold_reset:off"]]),
            )
        } else {
            return Err(ProvisionError::InvalidRequest(format!(
                "servo type {} cannot flash AP firmware",
                servo_type
            )));
        };
        Ok(Self {
            servo_type: servo_type.clone(),
            programmer,
            dut_on,
            dut_off,
            extra_args: Vec::new(),
        })
    }
}

/// What servo preparation learned about the setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServoSetup {
    pub config: ServoConfig,
    pub serial: String,
    pub ec_chip: String,
}

/// Connection to a servo host running servod on `port`.
#[derive(Debug, Clone)]
pub struct ServoHost<C> {
    conn: C,
    port: u16,
}

impl<C: DeviceConnection> ServoHost<C> {
    pub fn new(conn: C, port: u16) -> Self {
        Self { conn, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `dut-control -p <port> <args...>`
    pub async fn run_dut_control(&self, args: &[&str]) -> Result<String> {
        let port = self.port.to_string();
        let mut full = vec!["-p", port.as_str()];
        full.extend_from_slice(args);
        self.conn.run_cmd("dut-control", &full).await
    }

    /// Run each command in order, stopping at the first failure.
    pub async fn run_all_dut_controls(&self, commands: &[Vec<String>]) -> Result<()> {
        for cmd in commands {
            let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
            self.run_dut_control(&args).await?;
        }
        Ok(())
    }

    /// Read a servod variable. Output has the form `name:value`.
    pub async fn get_variable(&self, name: &str) -> Result<String> {
        let out = self.run_dut_control(&[name]).await?;
        let out = out.trim();
        let value = match out.split_once(':') {
            Some((_, value)) => value,
            None => out,
        };
        Ok(value.trim().to_string())
    }

    /// Ask servod for its adapter, serial number and EC chip.
    ///
    /// CCD is preferred on dual setups when an EC image will be flashed.
    pub async fn prepare(&self, prefer_ccd: bool) -> Result<ServoSetup> {
        let unreachable_err = |what: &str, e: ProvisionError| {
            ProvisionError::DutUnreachablePreUpdate(format!(
                "failed to get {}: {}. Is servod running on port {} and connected to the DUT?",
                what, e, self.port
            ))
        };

        let mut servo_type = ServoType::new(
            &self
                .get_variable("servo_type")
                .await
                .map_err(|e| unreachable_err("servo_type", e))?,
        );
        if servo_type.is_multiple() {
            servo_type = servo_type.pick_subtype(prefer_ccd);
        }

        let option = servo_type.serial_number_option();
        let serial = self
            .get_variable(option)
            .await
            .map_err(|e| unreachable_err(option, e))?;
        let config = ServoConfig::new(&servo_type, &serial)
            .map_err(|e| ProvisionError::DutUnreachablePreUpdate(e.to_string()))?;
        let ec_chip = self
            .get_variable("ec_chip")
            .await
            .map_err(|e| unreachable_err("ec_chip", e))?;

        info!(
            "[servo] {} serial={} ec_chip={} on port {}",
            servo_type, serial, ec_chip, self.port
        );
        Ok(ServoSetup {
            config,
            serial,
            ec_chip,
        })
    }
}

#[async_trait]
impl<C: DeviceConnection> DeviceConnection for ServoHost<C> {
    async fn run_cmd(&self, cmd: &str, args: &[&str]) -> Result<String> {
        self.conn.run_cmd(cmd, args).await
    }

    async fn restart(&self) -> Result<()> {
        Err(ProvisionError::InvalidRequest(
            "restarting a servo host is not supported".to_string(),
        ))
    }

    fn describe(&self) -> String {
        format!("servo {}:{}", self.conn.describe(), self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[test]
    fn test_servo_type_predicates() {
        let t = ServoType::new("servo_v4_with_ccd_cr50");
        assert!(t.is_ccd() && !t.is_v2());
        assert!(!t.is_micro() && !t.is_multiple());
        assert_eq!(t.serial_number_option(), "ccd_serialname");

        let t = ServoType::new("servo_v4p1_with_servo_micro");
        assert!(t.is_micro());
        assert_eq!(t.serial_number_option(), "servo_micro_serialname");

        assert_eq!(ServoType::new("c2d2").serial_number_option(), "c2d2_serialname");
        assert_eq!(ServoType::new("servo_v2").serial_number_option(), "serialname");
    }

    #[test]
    fn test_pick_subtype() {
        let dual = ServoType::new("servo_v4p1_with_servo_micro_and_ccd_cr50");
        assert!(dual.is_multiple());
        assert_eq!(dual.pick_subtype(true).as_str(), "servo_v4p1_with_ccd_cr50");
        assert_eq!(dual.pick_subtype(false).as_str(), "servo_v4p1_with_servo_micro");
        let single = ServoType::new("servo_micro");
        assert_eq!(single.pick_subtype(true), single);
    }

    #[test]
    fn test_servo_config_programmers() {
        let ccd = ServoConfig::new(&ServoType::new("servo_v4_with_ccd_ti50"), "ABC").unwrap();
        assert_eq!(ccd.programmer, "raiden_debug_spi:target=AP,serial=ABC");
        assert!(ccd.dut_on.is_empty());

        let micro = ServoConfig::new(&ServoType::new("servo_micro"), "S1").unwrap();
        assert_eq!(micro.programmer, "raiden_debug_spi:serial=S1");
        assert_eq!(micro.dut_on, vec![vec!["cpu_fw_spi:on".to_string()]]);
        assert_eq!(micro.dut_off, vec![vec!["cpu_fw_spi:off".to_string()]]);

        assert!(ServoConfig::new(&ServoType::new("servo_v4"), "S").is_err());
    }

    struct FakeServod {
        vars: HashMap<&'static str, &'static str>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeviceConnection for FakeServod {
        async fn run_cmd(&self, cmd: &str, args: &[&str]) -> Result<String> {
            self.seen.lock().unwrap().push(format!("{} {}", cmd, args.join(" ")));
            let name = args.last().copied().unwrap_or_default();
            match self.vars.get(name) {
                Some(value) => Ok(format!("{}:{}\n", name, value)),
                None => Err(ProvisionError::CommandFailed {
                    host: "servo".to_string(),
                    command: name.to_string(),
                    stderr: "no such control".to_string(),
                    code: Some(1),
                }),
            }
        }

        async fn restart(&self) -> Result<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            "fake".to_string()
        }
    }

    #[tokio::test]
    async fn test_prepare_dual_servo_prefers_ccd_for_ec() {
        let servod = FakeServod {
            vars: HashMap::from([
                ("servo_type", "servo_v4p1_with_servo_micro_and_ccd_cr50"),
                ("ccd_serialname", "CCD123"),
                ("servo_micro_serialname", "MICRO9"),
                ("ec_chip", "it83xx"),
            ]),
            seen: Mutex::new(Vec::new()),
        };
        let host = ServoHost::new(servod, 9999);

        let setup = host.prepare(true).await.unwrap();
        assert_eq!(setup.serial, "CCD123");
        assert_eq!(setup.ec_chip, "it83xx");
        assert_eq!(setup.config.programmer, "raiden_debug_spi:target=AP,serial=CCD123");

        let setup = host.prepare(false).await.unwrap();
        assert_eq!(setup.serial, "MICRO9");
        assert!(host.conn.seen.lock().unwrap()[0].starts_with("dut-control -p 9999 servo_type"));
    }

    #[tokio::test]
    async fn test_prepare_without_servod_is_unreachable() {
        let host = ServoHost::new(
            FakeServod {
                vars: HashMap::new(),
                seen: Mutex::new(Vec::new()),
            },
            9999,
        );
        let err = host.prepare(false).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DutUnreachablePreUpdate);
        assert!(host.restart().await.is_err());
    }
}
