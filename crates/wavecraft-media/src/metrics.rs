//! Session metrics. Compiled to no-ops unless the `metrics` feature is on.

/// Record one text fragment (or end frame) handed to the transport.
pub fn record_frame_sent() {
    #[cfg(feature = "metrics")]
    metrics::counter!("frames_sent_total").increment(1);
}

/// Record one decoded audio buffer queued for playback.
pub fn record_audio_buffer(bytes: usize) {
    #[cfg(feature = "metrics")]
    {
        metrics::counter!("audio_buffers_total").increment(1);
        metrics::counter!("audio_bytes_total").increment(bytes as u64);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = bytes;
}

/// Record an audio payload dropped because it could not be decoded.
pub fn record_decode_drop() {
    #[cfg(feature = "metrics")]
    metrics::counter!("audio_decode_drops_total").increment(1);
}

/// Record a session ending in `Failed`, labelled by error kind.
pub fn record_session_failure(kind: &str) {
    #[cfg(feature = "metrics")]
    {
        let labels = [("kind", kind.to_string())];
        metrics::counter!("session_failures_total", &labels).increment(1);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = kind;
}

/// Record a session opening its transport.
pub fn record_session_open() {
    #[cfg(feature = "metrics")]
    metrics::gauge!("sessions_active").increment(1.0);
}

/// Record a session that opened its transport reaching a terminal state.
pub fn record_session_close() {
    #[cfg(feature = "metrics")]
    metrics::gauge!("sessions_active").decrement(1.0);
}
