//! User preference persistence using dconf
//!
//! Settings are stored in dconf under `/com/lines-recorder/`

use log::error;

const DCONF_PATH: &str = "/com/lines-recorder/";

/// Keys for dconf settings
mod keys {
    pub const INPUT_DEVICE: &str = "input-device";
}

fn key(name: &str) -> String {
    format!("{}{}", DCONF_PATH, name)
}

/// Get the display name of the last selected input device
pub fn get_input_device() -> Option<String> {
    dconf_rs::get_string(&key(keys::INPUT_DEVICE))
        .ok()
        .filter(|name| !name.is_empty())
}

/// Remember the selected input device by display name
pub fn set_input_device(name: &str) {
    if let Err(e) = dconf_rs::set_string(&key(keys::INPUT_DEVICE), name) {
        error!("Failed to save input device to dconf: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_live_under_app_path() {
        assert_eq!(key(keys::INPUT_DEVICE), "/com/lines-recorder/input-device");
    }
}
