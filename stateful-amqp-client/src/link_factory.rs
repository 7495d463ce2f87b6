//! Link settings per channel
//!
//! Every channel of a transport attaches one sending and one receiving link.
//! [`LinkFactory`] builds their [`LinkSettings`]: a fresh link name per
//! attach, device or module addresses, settle modes and the attach
//! properties the hub expects. Method, twin and stream links carry a channel
//! correlation id shared by all links of one transport.

use crate::link_layer::{LinkRole, LinkSettings, ReceiverSettleMode, SenderSettleMode};
use stateful_amqp_core::{DeviceIdentity, Topic};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Attach property carrying the client version string
pub const CLIENT_VERSION_PROPERTY: &str = "com.microsoft:client-version";
/// Attach property carrying the service API version
pub const API_VERSION_PROPERTY: &str = "com.microsoft:api-version";
/// Attach property pairing the sending and receiving link of a channel
pub const CHANNEL_CORRELATION_ID_PROPERTY: &str = "com.microsoft:channel-correlation-id";
/// Attach property carrying a sender's operation timeout in milliseconds
pub const TIMEOUT_PROPERTY: &str = "com.microsoft:timeout";

/// Service API version requested on every link
pub const API_VERSION: &str = "2019-10-01";

struct Addresses {
    device: &'static str,
    module: &'static str,
}

const EVENTS: Addresses = Addresses {
    device: "/devices/{device}/messages/events",
    module: "/devices/{device}/modules/{module}/messages/events",
};

const DEVICE_BOUND: Addresses = Addresses {
    device: "/devices/{device}/messages/deviceBound",
    module: "/devices/{device}/modules/{module}/messages/deviceBound",
};

const METHODS: Addresses = Addresses {
    device: "/devices/{device}/methods/deviceBound",
    module: "/devices/{device}/modules/{module}/methods/deviceBound",
};

const TWIN: Addresses = Addresses {
    device: "/devices/{device}/twin",
    module: "/devices/{device}/modules/{module}/twin",
};

const STREAMS: Addresses = Addresses {
    device: "/devices/{device}/streams",
    module: "/devices/{device}/modules/{module}/streams",
};

/// Builds link settings for one transport
#[derive(Debug, Clone)]
pub struct LinkFactory {
    correlation_id: Uuid,
}

impl LinkFactory {
    /// Factory with a random channel correlation id
    pub fn new() -> Self {
        Self::with_correlation_id(Uuid::new_v4())
    }

    pub fn with_correlation_id(correlation_id: Uuid) -> Self {
        Self { correlation_id }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Settings for the sending link of `topic`
    pub fn sending_link_settings(&self, identity: &DeviceIdentity, topic: Topic) -> LinkSettings {
        let (addresses, suffix, settle) = match topic {
            Topic::Message => (&EVENTS, "_TelemetrySenderLink", None),
            Topic::Method => (&METHODS, "_MethodsSenderLink", Some(settled_first())),
            Topic::Twin => (&TWIN, "_TwinSenderLink", Some(settled_first())),
            Topic::DeviceStreaming => (&STREAMS, "_StreamsSenderLink", Some(settled_first())),
        };

        LinkSettings {
            name: link_name(suffix),
            role: LinkRole::Sender,
            source: Some(identity.device_id.clone()),
            target: Some(link_address(identity, addresses)),
            sender_settle_mode: settle.map(|(snd, _)| snd),
            receiver_settle_mode: settle.map(|(_, rcv)| rcv),
            total_link_credit: 0,
            auto_send_flow: false,
            properties: self.properties(identity, topic),
        }
    }

    /// Settings for the receiving link of `topic`
    ///
    /// On the message channel a device receives cloud-to-device messages and
    /// settles them explicitly, while a module receives routed events.
    pub fn receiving_link_settings(&self, identity: &DeviceIdentity, topic: Topic) -> LinkSettings {
        let (addresses, suffix, sender_settle, receiver_settle) = match topic {
            Topic::Message if identity.module().is_none() => (
                &DEVICE_BOUND,
                "_TelemetryReceiverLink",
                None,
                ReceiverSettleMode::Second,
            ),
            Topic::Message => (&EVENTS, "_EventsReceiverLink", None, ReceiverSettleMode::First),
            Topic::Method => (
                &METHODS,
                "_MethodsReceiverLink",
                Some(SenderSettleMode::Settled),
                ReceiverSettleMode::First,
            ),
            Topic::Twin => (
                &TWIN,
                "_TwinReceiverLink",
                Some(SenderSettleMode::Settled),
                ReceiverSettleMode::First,
            ),
            Topic::DeviceStreaming => (
                &STREAMS,
                "_StreamsReceiverLink",
                Some(SenderSettleMode::Settled),
                ReceiverSettleMode::First,
            ),
        };

        let credit = identity.settings.prefetch_count;
        LinkSettings {
            name: link_name(suffix),
            role: LinkRole::Receiver,
            source: Some(link_address(identity, addresses)),
            target: None,
            sender_settle_mode: sender_settle,
            receiver_settle_mode: Some(receiver_settle),
            total_link_credit: credit,
            auto_send_flow: credit > 0,
            properties: self.properties(identity, topic),
        }
    }

    /// Channel correlation id for `topic`, if the channel pairs its links
    pub fn channel_correlation_id(&self, topic: Topic) -> Option<String> {
        let prefix = match topic {
            Topic::Message => return None,
            Topic::Method => "methods:",
            Topic::Twin => "twin:",
            Topic::DeviceStreaming => "streams:",
        };
        Some(format!("{}{}", prefix, self.correlation_id))
    }

    fn properties(&self, identity: &DeviceIdentity, topic: Topic) -> BTreeMap<String, String> {
        let mut properties = BTreeMap::new();
        properties.insert(CLIENT_VERSION_PROPERTY.to_string(), identity.product_info.clone());
        properties.insert(API_VERSION_PROPERTY.to_string(), API_VERSION.to_string());
        if let Some(correlation_id) = self.channel_correlation_id(topic) {
            properties.insert(CHANNEL_CORRELATION_ID_PROPERTY.to_string(), correlation_id);
        }
        properties
    }
}

impl Default for LinkFactory {
    fn default() -> Self {
        Self::new()
    }
}

fn settled_first() -> (SenderSettleMode, ReceiverSettleMode) {
    (SenderSettleMode::Settled, ReceiverSettleMode::First)
}

fn link_name(suffix: &str) -> String {
    format!("{}{}", Uuid::new_v4(), suffix)
}

fn link_address(identity: &DeviceIdentity, addresses: &Addresses) -> String {
    let device = urlencoding::encode(&identity.device_id);
    let path = match identity.module() {
        Some(module) => addresses
            .module
            .replace("{device}", &device)
            .replace("{module}", &urlencoding::encode(module)),
        None => addresses.device.replace("{device}", &device),
    };
    format!("{}{}", identity.amqp_endpoint(), path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stateful_amqp_core::{AmqpTransportSettings, AuthenticationModel};

    fn device() -> DeviceIdentity {
        DeviceIdentity::new(
            "hub.example.net",
            "device 1",
            AuthenticationModel::SasIndividual,
            AmqpTransportSettings::default().with_prefetch_count(20),
        )
        .with_product_info("test-agent/1.0")
    }

    #[test]
    fn test_message_sender_settings() {
        let factory = LinkFactory::new();
        let settings = factory.sending_link_settings(&device(), Topic::Message);

        assert!(settings.name.ends_with("_TelemetrySenderLink"));
        assert_eq!(settings.role, LinkRole::Sender);
        assert_eq!(
            settings.target.as_deref(),
            Some("amqps://hub.example.net:5671/devices/device%201/messages/events")
        );
        assert_eq!(settings.source.as_deref(), Some("device 1"));
        assert_eq!(settings.sender_settle_mode, None);
        assert_eq!(settings.receiver_settle_mode, None);
        assert_eq!(settings.property(CLIENT_VERSION_PROPERTY), Some("test-agent/1.0"));
        assert_eq!(settings.property(API_VERSION_PROPERTY), Some(API_VERSION));
        assert_eq!(settings.property(CHANNEL_CORRELATION_ID_PROPERTY), None);
    }

    #[test]
    fn test_link_names_are_unique() {
        let factory = LinkFactory::new();
        let a = factory.sending_link_settings(&device(), Topic::Twin);
        let b = factory.sending_link_settings(&device(), Topic::Twin);
        assert_ne!(a.name, b.name);
    }

    #[test]
    fn test_method_links_share_correlation_id() {
        let id = Uuid::new_v4();
        let factory = LinkFactory::with_correlation_id(id);
        let sender = factory.sending_link_settings(&device(), Topic::Method);
        let receiver = factory.receiving_link_settings(&device(), Topic::Method);

        let expected = format!("methods:{id}");
        assert_eq!(sender.property(CHANNEL_CORRELATION_ID_PROPERTY), Some(expected.as_str()));
        assert_eq!(receiver.property(CHANNEL_CORRELATION_ID_PROPERTY), Some(expected.as_str()));
        assert_eq!(sender.sender_settle_mode, Some(SenderSettleMode::Settled));
        assert_eq!(receiver.receiver_settle_mode, Some(ReceiverSettleMode::First));
        assert_eq!(
            receiver.source.as_deref(),
            Some("amqps://hub.example.net:5671/devices/device%201/methods/deviceBound")
        );
    }

    #[test]
    fn test_device_receives_cloud_to_device_messages() {
        let factory = LinkFactory::new();
        let settings = factory.receiving_link_settings(&device(), Topic::Message);

        assert!(settings.name.ends_with("_TelemetryReceiverLink"));
        assert_eq!(settings.role, LinkRole::Receiver);
        assert_eq!(settings.receiver_settle_mode, Some(ReceiverSettleMode::Second));
        assert_eq!(settings.total_link_credit, 20);
        assert!(settings.auto_send_flow);
        assert_eq!(
            settings.source.as_deref(),
            Some("amqps://hub.example.net:5671/devices/device%201/messages/deviceBound")
        );
    }

    #[test]
    fn test_module_receives_events() {
        let factory = LinkFactory::new();
        let module = device().with_module_id("filter/a");
        let settings = factory.receiving_link_settings(&module, Topic::Message);

        assert!(settings.name.ends_with("_EventsReceiverLink"));
        assert_eq!(settings.receiver_settle_mode, Some(ReceiverSettleMode::First));
        assert_eq!(
            settings.source.as_deref(),
            Some("amqps://hub.example.net:5671/devices/device%201/modules/filter%2Fa/messages/events")
        );
    }

    #[test]
    fn test_zero_prefetch_disables_auto_flow() {
        let mut id = device();
        id.settings.prefetch_count = 0;
        let settings = LinkFactory::new().receiving_link_settings(&id, Topic::Twin);
        assert_eq!(settings.total_link_credit, 0);
        assert!(!settings.auto_send_flow);
        assert!(settings
            .property(CHANNEL_CORRELATION_ID_PROPERTY)
            .map_or(false, |c| c.starts_with("twin:")));
    }

    #[test]
    fn test_stream_addresses() {
        let factory = LinkFactory::new();
        let sender = factory.sending_link_settings(&device(), Topic::DeviceStreaming);
        assert!(sender.name.ends_with("_StreamsSenderLink"));
        assert_eq!(
            sender.target.as_deref(),
            Some("amqps://hub.example.net:5671/devices/device%201/streams")
        );
        assert_eq!(
            factory.channel_correlation_id(Topic::DeviceStreaming),
            Some(format!("streams:{}", factory.correlation_id()))
        );
    }
}
