const TOPIC_BASE: &str = "dev/";
const TOPIC_RESPONSE: &str = "/RES";

/// Command topic of a device: `dev/<id>`.
pub fn device(device_id: &str) -> String {
    format!("{TOPIC_BASE}{device_id}")
}

/// Response topic of a device: `dev/<id>/RES`.
pub fn device_response(device_id: &str) -> String {
    format!("{}{TOPIC_RESPONSE}", device(device_id))
}

/// Fleet topic where CONNECT handshakes are announced.
pub fn connections() -> String {
    format!("{TOPIC_BASE}CONNECTIONS")
}

/// Fleet topic carrying CONNACK answers.
pub fn connections_response() -> String {
    format!("{}{TOPIC_RESPONSE}", connections())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        assert_eq!(device("sc01"), "dev/sc01");
        assert_eq!(device_response("sc01"), "dev/sc01/RES");
        assert_eq!(connections(), "dev/CONNECTIONS");
        assert_eq!(connections_response(), "dev/CONNECTIONS/RES");
    }
}
