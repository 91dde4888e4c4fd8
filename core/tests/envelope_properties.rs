//! Property tests for envelope decoding and the wire format.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use dddbus_core::Envelope;
use dddbus_core::wire::WireEvent;
use proptest::prelude::*;
use std::collections::HashMap;

fn arb_envelope() -> impl Strategy<Value = Envelope> {
    (
        any::<u128>(),
        any::<i64>(),
        "[a-z][a-z0-9._-]{0,30}",
        ".{0,64}",
    )
        .prop_map(|(id, time, event_type, payload)| {
            let id = dddbus_core::Uuid::from_u128(id).to_string();
            let payload = serde_json::to_vec(&payload).unwrap();
            Envelope::decode(&id, time, event_type, payload).unwrap()
        })
}

fn assert_same(decoded: &Envelope, original: &Envelope) {
    assert_eq!(decoded.id(), original.id());
    assert_eq!(decoded.event_type(), original.event_type());
    assert_eq!(decoded.timestamp_nanos(), original.timestamp_nanos());
    assert_eq!(decoded.occurred_at(), original.occurred_at());
    assert_eq!(decoded.payload(), original.payload());
}

proptest! {
    #[test]
    fn json_wire_round_trip(envelope in arb_envelope()) {
        let bytes = WireEvent::from_envelope(&envelope).unwrap().to_json().unwrap();
        let decoded = WireEvent::from_json(&bytes).unwrap().into_envelope().unwrap();
        assert_same(&decoded, &envelope);
    }

    #[test]
    fn stream_fields_round_trip(envelope in arb_envelope()) {
        let fields: HashMap<&str, String> = WireEvent::from_envelope(&envelope)
            .unwrap()
            .to_fields()
            .into_iter()
            .collect();
        let decoded = WireEvent::from_fields(|name| fields.get(name).cloned())
            .unwrap()
            .into_envelope()
            .unwrap();
        assert_same(&decoded, &envelope);
    }

    #[test]
    fn invalid_ids_never_decode(id in "[^0-9a-fA-F-]{1,40}") {
        let payload = b"{}".to_vec();
        prop_assert!(Envelope::decode(&id, 0, "t", payload).is_err());
    }
}

#[test]
fn freshly_created_envelope_round_trips() {
    let envelope = Envelope::new("order.created", &serde_json::json!({ "id": 1 })).unwrap();
    let bytes = WireEvent::from_envelope(&envelope).unwrap().to_json().unwrap();
    let decoded = WireEvent::from_json(&bytes).unwrap().into_envelope().unwrap();

    assert_same(&decoded, &envelope);
    assert_eq!(decoded.payload_as::<serde_json::Value>().unwrap(), serde_json::json!({ "id": 1 }));
}
