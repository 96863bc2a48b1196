use serde_json::{json, Map, Value};

use super::{timestamp_ms, Method};
use crate::model::SensorSpec;

/// Borrowed view of a device as announced in a CONNECT handshake.
#[derive(Debug, Clone, Copy)]
pub struct ConnectDevice<'a> {
    pub id: &'a str,
    pub latitude: f64,
    pub longitude: f64,
    pub sensors: &'a [SensorSpec],
}

fn header(name: &str) -> Map<String, Value> {
    let mut header = Map::new();
    header.insert("NAME".into(), Value::from(name));
    header.insert("TIMESTAMP".into(), Value::from(timestamp_ms()));
    header
}

fn response(method: Method, header: Map<String, Value>, body: Map<String, Value>) -> String {
    let mut message = Map::new();
    message.insert("METHOD".into(), Value::from(method.as_str()));
    message.insert("CODE".into(), Value::from("POST"));
    message.insert("HEADER".into(), Value::Object(header));
    message.insert("BODY".into(), Value::Object(body));
    Value::Object(message).to_string()
}

/// Window of samples published by a running sensor.
pub fn build_flow_response(
    device_id: &str,
    sensor_id: &str,
    publish_ms: i64,
    collect_ms: i64,
    values: &[i64],
) -> String {
    let mut body = Map::new();
    body.insert(sensor_id.into(), Value::from(values.to_vec()));
    body.insert(
        "FLOW".into(),
        json!({ "publish": publish_ms, "collect": collect_ms }),
    );
    response(Method::Flow, header(device_id), body)
}

pub fn build_get_response(device_id: &str, sensor_id: &str, value: i64) -> String {
    let mut body = Map::new();
    body.insert(sensor_id.into(), Value::from(value));
    response(Method::Get, header(device_id), body)
}

/// Handshake request announced on the fleet topic. `TIME_OUT` and
/// `SOURCE_IP` are left out when absent.
pub fn build_connect(
    device: &ConnectDevice<'_>,
    source_ip: Option<&str>,
    timeout_ms: Option<u64>,
) -> String {
    let mut header = header(device.id);
    if let Some(ip) = source_ip {
        header.insert("SOURCE_IP".into(), Value::from(ip));
    }

    let sensors: Vec<Value> = device
        .sensors
        .iter()
        .map(|sensor| {
            json!({
                "id": sensor.id,
                "type": sensor.sensor_type,
                "collection_time": sensor.collection_interval_ms,
                "publishing_time": sensor.publish_interval_ms,
            })
        })
        .collect();

    let mut body = Map::new();
    if let Some(timeout) = timeout_ms {
        body.insert("TIME_OUT".into(), Value::from(timeout));
    }
    body.insert("HEADER".into(), Value::Object(header));
    body.insert(
        "DEVICE".into(),
        json!({
            "id": device.id,
            "latitude": device.latitude,
            "longitude": device.longitude,
            "sensors": sensors,
        }),
    );

    format!("CONNECT VALUE BROKER {}", Value::Object(body))
}

/// Gateway answer to a CONNECT.
pub fn build_connack(name: &str, new_name: &str, success: bool) -> String {
    let mut body = Map::new();
    body.insert("NEW_NAME".into(), Value::from(new_name));
    body.insert("CAN_CONNECT".into(), Value::from(success));
    response(Method::Connack, header(name), body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tatu::TatuMessage;

    fn stamped(raw: &str) -> i64 {
        let value: Value = serde_json::from_str(raw).unwrap();
        value["HEADER"]["TIMESTAMP"].as_i64().unwrap()
    }

    fn sensor(id: &str) -> SensorSpec {
        SensorSpec::new(id, "thermometer", 1000, 3000, 10, 30, 1).unwrap()
    }

    #[test]
    fn test_flow_response_wire_format() {
        let raw = build_flow_response("D1", "S1", 1000, 200, &[10, 11, 12]);
        let ts = stamped(&raw);
        assert_eq!(
            raw,
            format!(
                r#"{{"METHOD":"FLOW","CODE":"POST","HEADER":{{"NAME":"D1","TIMESTAMP":{ts}}},"BODY":{{"S1":[10,11,12],"FLOW":{{"publish":1000,"collect":200}}}}}}"#
            )
        );
    }

    #[test]
    fn test_get_response_wire_format() {
        let raw = build_get_response("D1", "S1", 22);
        let ts = stamped(&raw);
        assert_eq!(
            raw,
            format!(
                r#"{{"METHOD":"GET","CODE":"POST","HEADER":{{"NAME":"D1","TIMESTAMP":{ts}}},"BODY":{{"S1":22}}}}"#
            )
        );
    }

    #[test]
    fn test_built_responses_decode_back() {
        let raw = build_flow_response("D1", "S1", 1000, 200, &[1]);
        let msg = TatuMessage::decode(&raw).unwrap();
        assert_eq!(msg.method, Method::Flow);
        assert_eq!(msg.target, "S1");
        assert!(msg.is_response);
        assert_eq!(msg.content, raw);

        let raw = build_connack("D1", "D1", false);
        let msg = TatuMessage::decode(&raw).unwrap();
        assert_eq!(msg.method, Method::Connack);
        assert_eq!(msg.content_json().unwrap()["BODY"]["CAN_CONNECT"], false);
    }

    #[test]
    fn test_connect_with_timeout_and_source_ip() {
        let sensors = [sensor("temp"), sensor("hum")];
        let device = ConnectDevice {
            id: "sc01",
            latitude: 12.5,
            longitude: -40.0,
            sensors: &sensors,
        };
        let raw = build_connect(&device, Some("10.0.0.7"), Some(10_000));
        let json = raw.strip_prefix("CONNECT VALUE BROKER ").unwrap();
        assert!(json.starts_with(r#"{"TIME_OUT":10000,"HEADER":{"NAME":"sc01","TIMESTAMP":"#));

        let value: Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["HEADER"]["SOURCE_IP"], "10.0.0.7");
        assert_eq!(value["DEVICE"]["id"], "sc01");
        assert_eq!(value["DEVICE"]["sensors"][1]["id"], "hum");
        assert_eq!(value["DEVICE"]["sensors"][0]["collection_time"], 1000);
        assert_eq!(value["DEVICE"]["sensors"][0]["publishing_time"], 3000);

        let msg = TatuMessage::decode(&raw).unwrap();
        assert_eq!(msg.method, Method::Connect);
        assert_eq!(msg.target, "BROKER");
        assert_eq!(msg.content, json);
    }

    #[test]
    fn test_connect_omits_absent_fields() {
        let device = ConnectDevice {
            id: "sc01",
            latitude: 0.0,
            longitude: 0.0,
            sensors: &[],
        };
        let raw = build_connect(&device, None, None);
        assert!(!raw.contains("TIME_OUT"));
        assert!(!raw.contains("SOURCE_IP"));
        assert!(raw.contains(r#""sensors":[]"#));
    }
}
