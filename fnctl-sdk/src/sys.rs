use {
    std::fmt::Display,
    serde::Serialize,
    fnctl_core::{Context, Event, GuestOutput, GuestPayload, pack_ptr_len},
};

// exports:
#[unsafe(no_mangle)]
pub extern "C" fn fnctl_alloc(len: i32) -> i32 {
    let mut buffer = Vec::<u8>::with_capacity(len.max(0) as usize);
    let ptr = buffer.as_mut_ptr();
    std::mem::forget(buffer);
    ptr as usize as i32
}

/// Reads the payload written by the host into a buffer from [`fnctl_alloc`], runs `func` and
/// returns the packed location of the output envelope.
///
/// The output buffer is never freed: the host creates a fresh instance for every call.
pub fn invoke<R, E, F>(ptr: i32, len: i32, func: F) -> i64
where
    R: Serialize,
    E: Display,
    F: FnOnce(Event, Context) -> Result<R, E>,
{
    let len = len.max(0) as usize;
    // SAFETY: host wrote exactly `len` bytes into the buffer it got from `fnctl_alloc(len)`
    let input = unsafe { Vec::from_raw_parts(ptr as usize as *mut u8, len, len) };
    let output = handle_payload(&input, func).into_boxed_slice();

    let output_len = output.len() as u32;
    let output_ptr = Box::into_raw(output) as *mut u8 as usize as u32;
    pack_ptr_len(output_ptr, output_len)
}

/// Decodes the payload, runs `func` and encodes its outcome as an output envelope.
pub fn handle_payload<R, E, F>(input: &[u8], func: F) -> Vec<u8>
where
    R: Serialize,
    E: Display,
    F: FnOnce(Event, Context) -> Result<R, E>,
{
    let output = match serde_json::from_slice::<GuestPayload>(input) {
        Ok(payload) => match func(payload.event, payload.context) {
            Ok(result) => match serde_json::to_value(result) {
                Ok(v) => GuestOutput::Ok(v),
                Err(err) => GuestOutput::Err(format!("failed to serialize handler result: {err}")),
            },
            Err(err) => GuestOutput::Err(err.to_string()),
        },
        Err(err) => GuestOutput::Err(format!("failed to parse payload: {err}")),
    };

    serde_json::to_vec(&output)
        .unwrap_or_else(|_| br#"{"err":"failed to serialize output"}"#.to_vec())
}
