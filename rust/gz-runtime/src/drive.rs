//! Poll loop against an inference host.

use gz_features::FEATURE_SCHEMA_ID;
use gz_infer::protocol::{BatchRequestV1, BatchResponseV1};
use gz_infer::{BatchShape, BoundaryError, ClientError, InferenceHost, PredictionView};

use crate::scheduler::ReadyEvent;

/// Anything polled with prediction batches until it reports `Done`.
pub trait PollDriver {
    type Error: From<BoundaryError> + From<ClientError>;

    fn batch_shape(&self) -> &BatchShape;

    fn poll_batch(&mut self, predictions: &PredictionView<'_>)
        -> Result<ReadyEvent<'_>, Self::Error>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DriveStats {
    pub polls: u64,
    pub batches: u64,
    pub predictions: u64,
}

/// Poll `p` until it is done, sending every batch it hands out to `host`.
pub fn drive<P, H>(p: &mut P, host: &mut H) -> Result<DriveStats, P::Error>
where
    P: PollDriver + ?Sized,
    H: InferenceHost + ?Sized,
{
    let shape = p.batch_shape().clone();
    let mut stats = DriveStats::default();
    let mut response: Option<BatchResponseV1> = None;
    let mut batch_id = 0u64;
    loop {
        let request = {
            let view = match &response {
                None => PredictionView::empty(&shape),
                Some(r) => PredictionView::from_response(&shape, r)?,
            };
            stats.polls += 1;
            match p.poll_batch(&view)? {
                ReadyEvent::Done => return Ok(stats),
                ReadyEvent::Predict { count, channels } => BatchRequestV1 {
                    batch_id,
                    feature_schema_id: FEATURE_SCHEMA_ID,
                    channel_len: shape.channel_len as u32,
                    count: count as u32,
                    channels: channels.to_vec(),
                },
            }
        };
        batch_id += 1;
        stats.batches += 1;
        stats.predictions += u64::from(request.count);
        response = Some(host.predict(&request)?);
    }
}
