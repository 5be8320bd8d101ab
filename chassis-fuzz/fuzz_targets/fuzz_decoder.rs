#![no_main]

use bytes::Bytes;
use chassis_core::buffer::FrameBuffer;
use chassis_proto::codec::FrameDecoder;
use chassis_proto::command::Command;
use chassis_proto::policy::Policy;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Frame decoding must never panic, whatever the bytes. Split the
    // input into two pushes so segment boundaries get exercised too.
    let mut buffer = FrameBuffer::new();
    let split = data.len() / 2;
    buffer.push(Bytes::copy_from_slice(&data[..split]));
    buffer.push(Bytes::copy_from_slice(&data[split..]));

    let mut decoder = FrameDecoder::default();
    while let Ok(Some(raw)) = decoder.decode(&mut buffer) {
        // Payload decoding must also be panic-free.
        let _ = Command::decode_payload(raw.id, &raw.payload);
    }

    // The policy blob has its own byte order and nesting; hit it directly.
    let mut blob = data;
    let _ = Policy::deserialize(&mut blob);
});
