use tokio::sync::mpsc;

use crate::transport::measurement::Measurement;

/// The lazy, single-consumer measurement stream a subscriber exposes.
///
/// `next` blocks until a measurement arrives and returns `None` once the
///  subscriber shuts down for good (user disconnect, or connection loss with
///  auto-reconnect disabled). The queue behind it is bounded: a consumer
///  that cannot keep up eventually blocks the socket reader, which is the
///  backpressure contract for TCP-only pipelines.
pub struct MeasurementReader {
    rx: mpsc::Receiver<Measurement>,
}

impl MeasurementReader {
    pub(super) fn new(rx: mpsc::Receiver<Measurement>) -> MeasurementReader {
        MeasurementReader { rx }
    }

    pub async fn next(&mut self) -> Option<Measurement> {
        self.rx.recv().await
    }

    /// Non-blocking variant; `None` means "nothing queued right now", not
    ///  end of stream.
    pub fn try_next(&mut self) -> Option<Measurement> {
        self.rx.try_recv().ok()
    }
}
