use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::transport::constants::{data_packet_flags, OperationalEncoding};
use crate::util::buf::{decode_str, encode_str};

/// Everything a subscriber requests with `Subscribe`, carried as a
///  `key=value;` connection string so that unknown parameters pass through
///  harmlessly between implementations.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    pub filter_expression: String,

    pub throttled: bool,
    pub publish_interval: f64,

    pub include_time: bool,
    pub use_millisecond_resolution: bool,
    pub use_double_precision: bool,
    pub request_nan_value_filter: bool,

    pub processing_interval: i32,

    /// request data packets on a UDP socket the subscriber listens on
    pub udp_data_channel: Option<UdpDataChannel>,
    /// request cipher key exchange for the UDP data channel
    pub encrypted: bool,

    pub start_time: String,
    pub stop_time: String,
    pub extra_parameters: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UdpDataChannel {
    pub local_port: u16,
    pub interface: Option<String>,
}

impl Default for SubscriptionInfo {
    fn default() -> Self {
        SubscriptionInfo {
            filter_expression: String::new(),
            throttled: false,
            publish_interval: 1.0,
            include_time: true,
            use_millisecond_resolution: false,
            use_double_precision: false,
            request_nan_value_filter: false,
            processing_interval: -1,
            udp_data_channel: None,
            encrypted: false,
            start_time: String::new(),
            stop_time: String::new(),
            extra_parameters: String::new(),
        }
    }
}

impl SubscriptionInfo {
    pub fn with_filter(filter_expression: &str) -> SubscriptionInfo {
        SubscriptionInfo {
            filter_expression: filter_expression.to_string(),
            ..Default::default()
        }
    }

    pub fn to_connection_string(&self) -> String {
        let mut parts = vec![
            format!("throttled={}", self.throttled),
            format!("publishInterval={:.6}", self.publish_interval),
            format!("includeTime={}", self.include_time),
            format!("processingInterval={}", self.processing_interval),
            format!("useMillisecondResolution={}", self.use_millisecond_resolution),
            format!("useDoublePrecision={}", self.use_double_precision),
            format!("requestNaNValueFilter={}", self.request_nan_value_filter),
        ];

        if !self.filter_expression.is_empty() {
            parts.push(format!("filterExpression={{{}}}", self.filter_expression));
        }
        if let Some(udp) = &self.udp_data_channel {
            match &udp.interface {
                Some(interface) => parts.push(format!("dataChannel={{localport={};interface={}}}", udp.local_port, interface)),
                None => parts.push(format!("dataChannel={{localport={}}}", udp.local_port)),
            }
        }
        if self.encrypted {
            parts.push("encrypted=true".to_string());
        }
        if !self.start_time.is_empty() {
            parts.push(format!("startTimeConstraint={}", self.start_time));
        }
        if !self.stop_time.is_empty() {
            parts.push(format!("stopTimeConstraint={}", self.stop_time));
        }
        if !self.extra_parameters.is_empty() {
            parts.push(self.extra_parameters.clone());
        }

        parts.join(";")
    }

    pub fn parse_connection_string(connection_string: &str) -> anyhow::Result<SubscriptionInfo> {
        let mut info = SubscriptionInfo::default();

        for (key, value) in split_parameters(connection_string)? {
            match key.to_ascii_lowercase().as_str() {
                "throttled" => info.throttled = parse_bool(&value)?,
                "publishinterval" => info.publish_interval = value.parse()
                    .map_err(|e| anyhow!("invalid publishInterval {:?}: {}", value, e))?,
                "includetime" => info.include_time = parse_bool(&value)?,
                "processinginterval" => info.processing_interval = value.parse()
                    .map_err(|e| anyhow!("invalid processingInterval {:?}: {}", value, e))?,
                "usemillisecondresolution" => info.use_millisecond_resolution = parse_bool(&value)?,
                "usedoubleprecision" => info.use_double_precision = parse_bool(&value)?,
                "requestnanvaluefilter" => info.request_nan_value_filter = parse_bool(&value)?,
                "filterexpression" => info.filter_expression = value,
                "datachannel" => info.udp_data_channel = Some(parse_data_channel(&value)?),
                "encrypted" => info.encrypted = parse_bool(&value)?,
                "starttimeconstraint" => info.start_time = value,
                "stoptimeconstraint" => info.stop_time = value,
                _ => {
                    // unknown parameters are ignored, they may be meant for
                    //  a different implementation
                }
            }
        }

        Ok(info)
    }

    /// The `Subscribe` command payload:
    ///  `[u8 data packet flags][u32 length][connection string]`.
    pub fn ser_subscribe_payload(&self, buf: &mut BytesMut, encoding: OperationalEncoding) {
        let connection_string = encode_str(&self.to_connection_string(), encoding);
        buf.put_u8(data_packet_flags::COMPACT);
        buf.put_u32(connection_string.len() as u32);
        buf.put_slice(&connection_string);
    }

    pub fn try_deser_subscribe_payload(mut buf: impl Buf, encoding: OperationalEncoding) -> anyhow::Result<SubscriptionInfo> {
        let flags = buf.try_get_u8()?;
        if flags & data_packet_flags::COMPACT == 0 {
            bail!("only compact data packet encoding is supported");
        }

        let length = buf.try_get_u32()? as usize;
        if buf.remaining() < length {
            bail!("subscribe payload truncated: {} bytes announced, {} available", length, buf.remaining());
        }
        let mut raw = vec![0u8; length];
        buf.copy_to_slice(&mut raw);

        Self::parse_connection_string(&decode_str(&raw, encoding)?)
    }
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => bail!("invalid boolean parameter value {:?}", value),
    }
}

fn parse_data_channel(value: &str) -> anyhow::Result<UdpDataChannel> {
    let mut local_port = None;
    let mut interface = None;

    for (key, value) in split_parameters(value)? {
        match key.to_ascii_lowercase().as_str() {
            "localport" => {
                local_port = Some(value.parse()
                    .map_err(|e| anyhow!("invalid dataChannel localport {:?}: {}", value, e))?);
            }
            "interface" => interface = Some(value),
            _ => {}
        }
    }

    Ok(UdpDataChannel {
        local_port: local_port.ok_or_else(|| anyhow!("dataChannel is missing localport"))?,
        interface,
    })
}

/// Splits `key=value;key={value; with separators}` pairs, honoring one level
///  of brace nesting for embedded expressions.
fn split_parameters(s: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();

    let push_pair = |part: &str, pairs: &mut Vec<(String, String)>| -> anyhow::Result<()> {
        let part = part.trim();
        if part.is_empty() {
            return Ok(());
        }
        let (key, value) = part.split_once('=')
            .ok_or_else(|| anyhow!("connection string parameter without '=': {:?}", part))?;
        let value = value.trim();
        let value = value.strip_prefix('{')
            .and_then(|v| v.strip_suffix('}'))
            .unwrap_or(value);
        pairs.push((key.trim().to_string(), value.to_string()));
        Ok(())
    };

    for c in s.chars() {
        match c {
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth = depth.checked_sub(1).ok_or_else(|| anyhow!("unbalanced braces in connection string"))?;
                current.push(c);
            }
            ';' if depth == 0 => {
                push_pair(&current, &mut pairs)?;
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if depth != 0 {
        bail!("unbalanced braces in connection string");
    }
    push_pair(&current, &mut pairs)?;

    Ok(pairs)
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_connection_string_round_trip() {
        let info = SubscriptionInfo {
            filter_expression: "FILTER ActiveMeasurements WHERE True".to_string(),
            throttled: true,
            publish_interval: 0.033,
            include_time: true,
            use_millisecond_resolution: true,
            use_double_precision: true,
            request_nan_value_filter: false,
            processing_interval: 50,
            udp_data_channel: Some(UdpDataChannel { local_port: 9600, interface: None }),
            encrypted: true,
            start_time: "2022-08-14 00:00:00".to_string(),
            stop_time: String::new(),
            extra_parameters: String::new(),
        };

        let parsed = SubscriptionInfo::parse_connection_string(&info.to_connection_string()).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_filter_with_embedded_separators() {
        let info = SubscriptionInfo::with_filter("FILTER ActiveMeasurements WHERE SignalType = 'FREQ'; more");
        let parsed = SubscriptionInfo::parse_connection_string(&info.to_connection_string()).unwrap();
        assert_eq!(parsed.filter_expression, info.filter_expression);
    }

    #[rstest]
    #[case::utf8(OperationalEncoding::Utf8)]
    #[case::utf16(OperationalEncoding::Utf16Le)]
    fn test_subscribe_payload_round_trip(#[case] encoding: OperationalEncoding) {
        let mut info = SubscriptionInfo::with_filter("FILTER ActiveMeasurements WHERE True");
        info.udp_data_channel = Some(UdpDataChannel { local_port: 9601, interface: Some("0.0.0.0".to_string()) });

        let mut buf = BytesMut::new();
        info.ser_subscribe_payload(&mut buf, encoding);
        let parsed = SubscriptionInfo::try_deser_subscribe_payload(buf.freeze(), encoding).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_unknown_parameters_are_ignored() {
        let parsed = SubscriptionInfo::parse_connection_string(
            "throttled=false;assemblyInfo={source=test;version=1};includeTime=true").unwrap();
        assert!(parsed.include_time);
    }

    #[rstest]
    #[case::unbalanced("filterExpression={oops")]
    #[case::no_equals("justakey")]
    #[case::bad_bool("throttled=maybe")]
    fn test_malformed_connection_strings(#[case] s: &str) {
        assert!(SubscriptionInfo::parse_connection_string(s).is_err());
    }
}
