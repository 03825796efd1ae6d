//! Property-based codec tests.
//!
//! Uses proptest to verify:
//! 1. Any frame survives encode → decode.
//! 2. Random bytes never cause a panic in `decode` (returns `Err` gracefully).
//! 3. Frames decoded from arbitrary JSON objects keep the id they were given.

use courier_proto::codec;
use courier_proto::frame::{Frame, MessageId, Timestamp};
use proptest::prelude::*;

/// Strategy for generating arbitrary `MessageId` values.
fn arb_message_id() -> impl Strategy<Value = MessageId> {
    "[a-zA-Z0-9_-]{1,64}".prop_map(MessageId::new)
}

/// Strategy for generating arbitrary `Timestamp` values.
fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    any::<u64>().prop_map(Timestamp::from_millis)
}

/// Strategy for JSON payloads: scalars and shallow objects.
fn arb_payload() -> impl Strategy<Value = serde_json::Value> {
    let leaf = prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i64>().prop_map(serde_json::Value::from),
        ".{0,64}".prop_map(serde_json::Value::from),
    ];
    leaf.prop_recursive(2, 16, 4, |inner| {
        prop::collection::btree_map("[a-z]{1,8}", inner, 0..4)
            .prop_map(|m| serde_json::Value::Object(m.into_iter().collect()))
    })
}

/// Strategy for any `Frame` variant.
fn arb_frame() -> impl Strategy<Value = Frame> {
    prop_oneof![
        (arb_message_id(), arb_payload(), arb_timestamp()).prop_map(|(id, payload, timestamp)| {
            Frame::Message {
                id,
                payload,
                timestamp,
            }
        }),
        (arb_message_id(), arb_timestamp()).prop_map(|(id, timestamp)| Frame::Ack { id, timestamp }),
        (arb_message_id(), arb_timestamp()).prop_map(|(id, timestamp)| Frame::Ping { id, timestamp }),
        (arb_message_id(), arb_timestamp()).prop_map(|(id, timestamp)| Frame::Pong { id, timestamp }),
    ]
}

proptest! {
    /// Any frame survives an encode → decode round-trip.
    #[test]
    fn frame_round_trip(frame in arb_frame()) {
        let bytes = codec::encode(&frame).expect("encode should succeed");
        let decoded = codec::decode(&bytes).expect("decode should succeed");
        prop_assert_eq!(frame, decoded);
    }

    /// Random bytes never cause a panic when decoded.
    #[test]
    fn random_bytes_decode_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode(&bytes);
    }

    /// Hand-written ack JSON decodes to an ack with the same id.
    #[test]
    fn handwritten_ack_keeps_id(id in "[a-zA-Z0-9_-]{1,64}", ts in any::<u64>()) {
        let raw = format!(r#"{{"type":"ack","id":"{id}","timestamp":{ts}}}"#);
        let frame = codec::decode(raw.as_bytes()).expect("decode should succeed");
        prop_assert_eq!(frame.id().as_str(), id.as_str());
        prop_assert_eq!(frame.timestamp().as_millis(), ts);
    }
}
