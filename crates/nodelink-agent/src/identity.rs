//! Device identity provider

/// Stable identity of the device the agent runs on
pub trait DeviceIdentity: Send + Sync {
    fn device_id(&self) -> String;
    fn device_model(&self) -> String;
}

/// Identity fixed at construction
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    device_id: String,
    device_model: String,
}

impl StaticIdentity {
    pub fn new(device_id: impl Into<String>, device_model: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_model: device_model.into(),
        }
    }

    /// Host name as the id and OS description as the model
    pub fn from_host() -> Self {
        let device_id = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
        let device_model = match (sysinfo::System::name(), sysinfo::System::os_version()) {
            (Some(name), Some(version)) => format!("{} {} ({})", name, version, std::env::consts::ARCH),
            (Some(name), None) => format!("{} ({})", name, std::env::consts::ARCH),
            _ => std::env::consts::ARCH.to_string(),
        };
        Self::new(device_id, device_model)
    }
}

impl DeviceIdentity for StaticIdentity {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn device_model(&self) -> String {
        self.device_model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_identity() {
        let identity = StaticIdentity::new("device-1", "Pixel 8");
        assert_eq!(identity.device_id(), "device-1");
        assert_eq!(identity.device_model(), "Pixel 8");
    }

    #[test]
    fn test_from_host_is_populated() {
        let identity = StaticIdentity::from_host();
        assert!(!identity.device_id().is_empty());
        assert!(identity.device_model().contains(std::env::consts::ARCH));
    }
}
