//! Software H.264 decoding with openh264.
//!
//! openh264 is synchronous, so each session runs it on a worker thread and
//! delivers completions from there, the same way a hardware callback would.
//! Output comes out in display order without timestamps; every decoded
//! picture is matched to the pending sample with the lowest PTS.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use openh264::decoder::Decoder;
use openh264::formats::YUVSource;
use vpreview_codec::{
    i420_to_nv12, CompressedSample, Completion, CompletionSink, CpuImage, DecodeEngine,
    DecodeError, EngineSession, FormatConfig, FrameToken, I420Strides, NativeTexture, PixelFormat,
    PlatformBuffer,
};

use crate::nal;

/// openh264-backed engine. CPU output only.
#[derive(Debug, Default)]
pub struct SoftwareEngine;

impl SoftwareEngine {
    pub fn new() -> Self {
        Self
    }
}

impl DecodeEngine for SoftwareEngine {
    fn name(&self) -> &'static str {
        "openh264"
    }

    fn supports_zero_copy(&self) -> bool {
        false
    }

    fn create_session(
        &self,
        format: &FormatConfig,
        pixel_format: PixelFormat,
        sink: CompletionSink,
    ) -> Result<Box<dyn EngineSession>, DecodeError> {
        if pixel_format != PixelFormat::Nv12 {
            return Err(DecodeError::session_create(format!(
                "[openh264] {pixel_format:?} output is not supported"
            )));
        }
        Ok(Box::new(SoftwareSession::spawn(format, sink)?))
    }
}

enum Job {
    Decode(FrameToken, Bytes),
    Flush(mpsc::Sender<()>),
}

struct SoftwareSession {
    tx: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    nal_length_size: u8,
}

impl SoftwareSession {
    fn spawn(format: &FormatConfig, sink: CompletionSink) -> Result<Self, DecodeError> {
        let priming = nal::parameter_sets_annex_b(
            format.sps.iter().chain(format.pps.iter()).map(|s| s.as_ref()),
        );
        let (tx, rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), DecodeError>>(1);

        let worker = thread::Builder::new()
            .name(format!("openh264-{}", sink.session()))
            .spawn(move || {
                // The decoder stays on this thread for its whole life.
                let mut decoder = match Decoder::new() {
                    Ok(decoder) => decoder,
                    Err(e) => {
                        let _ = ready_tx.send(Err(DecodeError::session_create(format!(
                            "[openh264] decoder init failed: {e}"
                        ))));
                        return;
                    }
                };
                if let Err(e) = decoder.decode(&priming) {
                    let _ = ready_tx.send(Err(DecodeError::session_create(format!(
                        "[openh264] parameter sets rejected: {e}"
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                run_worker(&mut decoder, rx, sink);
            })
            .map_err(|e| DecodeError::session_create(format!("[openh264] spawn failed: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(DecodeError::session_create("[openh264] worker exited"));
            }
        }

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            nal_length_size: format.nal_length_size,
        })
    }

    fn shutdown(&mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("[openh264] worker panicked");
            }
        }
    }
}

fn run_worker(decoder: &mut Decoder, rx: mpsc::Receiver<Job>, sink: CompletionSink) {
    let mut pending: Vec<FrameToken> = Vec::new();
    for job in rx {
        match job {
            Job::Decode(token, data) => {
                pending.push(token);
                match decoder.decode(&data) {
                    Ok(Some(yuv)) => {
                        let picture = to_nv12(&yuv);
                        if let Some(out) = take_earliest(&mut pending) {
                            sink.deliver(completion(out, picture));
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        pending.retain(|t| t.sequence != token.sequence);
                        sink.deliver(Completion {
                            token,
                            result: Err(DecodeError::decode_failed(
                                token.sequence,
                                format!("openh264: {e}"),
                            )),
                        });
                    }
                }
            }
            Job::Flush(ack) => {
                let pictures: Vec<Result<CpuImage, DecodeError>> = if pending.is_empty() {
                    Vec::new()
                } else {
                    match decoder.flush_remaining() {
                        Ok(frames) => frames.iter().map(|yuv| to_nv12(yuv)).collect(),
                        Err(e) => {
                            tracing::warn!("[openh264] flush failed: {e}");
                            Vec::new()
                        }
                    }
                };
                for done in settle_flush(&mut pending, pictures) {
                    sink.deliver(done);
                }
                let _ = ack.send(());
            }
        }
    }
}

fn to_nv12<S: YUVSource>(yuv: &S) -> Result<CpuImage, DecodeError> {
    let (w, h) = yuv.dimensions();
    let (ys, us, vs) = yuv.strides();
    i420_to_nv12(
        yuv.y(),
        yuv.u(),
        yuv.v(),
        I420Strides { y: ys, u: us, v: vs },
        w as u32,
        h as u32,
    )
}

fn completion(token: FrameToken, picture: Result<CpuImage, DecodeError>) -> Completion {
    let result = picture.map(|image| Box::new(CpuBuffer { image }) as Box<dyn PlatformBuffer>);
    Completion { token, result }
}

/// Pair pictures released by a flush with the pending samples in PTS order.
/// Samples left without a picture fail.
fn settle_flush(
    pending: &mut Vec<FrameToken>,
    pictures: Vec<Result<CpuImage, DecodeError>>,
) -> Vec<Completion> {
    let mut done = Vec::with_capacity(pending.len());
    for picture in pictures {
        let Some(token) = take_earliest(pending) else {
            tracing::debug!("[openh264] flushed picture with no pending sample");
            break;
        };
        done.push(completion(token, picture));
    }
    if !pending.is_empty() {
        tracing::debug!("[openh264] {} samples without output at flush", pending.len());
    }
    while let Some(token) = take_earliest(pending) {
        done.push(Completion {
            token,
            result: Err(DecodeError::decode_failed(
                token.sequence,
                "no picture produced before flush",
            )),
        });
    }
    done
}

/// Remove and return the pending token with the lowest PTS.
fn take_earliest(pending: &mut Vec<FrameToken>) -> Option<FrameToken> {
    let idx = pending
        .iter()
        .enumerate()
        .min_by_key(|(_, t)| (t.pts, t.sequence))
        .map(|(i, _)| i)?;
    Some(pending.swap_remove(idx))
}

impl EngineSession for SoftwareSession {
    fn submit(&mut self, token: FrameToken, sample: &CompressedSample) -> Result<(), DecodeError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| DecodeError::submit_failed(token.sequence, "session invalidated"))?;
        let annex_b = nal::avcc_to_annex_b(&sample.data, self.nal_length_size)
            .map_err(|e| DecodeError::submit_failed(token.sequence, e.to_string()))?;
        if sample.keyframe && !nal::contains_idr(&sample.data, self.nal_length_size) {
            tracing::debug!(
                "[openh264] sync sample {} carries no IDR slice",
                token.sequence
            );
        }
        tx.send(Job::Decode(token, Bytes::from(annex_b)))
            .map_err(|_| DecodeError::submit_failed(token.sequence, "decoder worker exited"))
    }

    fn wait_for_async_completions(&mut self) -> Result<(), DecodeError> {
        let Some(tx) = self.tx.as_ref() else {
            return Ok(());
        };
        let (ack_tx, ack_rx) = mpsc::channel();
        if tx.send(Job::Flush(ack_tx)).is_err() || ack_rx.recv().is_err() {
            return Err(DecodeError::decode_failed(0, "decoder worker exited"));
        }
        Ok(())
    }

    fn invalidate(&mut self) {
        self.shutdown();
    }
}

impl Drop for SoftwareSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A decoded picture held in system memory.
struct CpuBuffer {
    image: CpuImage,
}

impl PlatformBuffer for CpuBuffer {
    fn width(&self) -> u32 {
        self.image.width
    }

    fn height(&self) -> u32 {
        self.image.height
    }

    fn pixel_format(&self) -> PixelFormat {
        self.image.format
    }

    fn export_native(&self) -> Result<NativeTexture, DecodeError> {
        Err(DecodeError::UnsupportedZeroCopy)
    }

    fn read_planes(&self) -> Result<CpuImage, DecodeError> {
        Ok(self.image.clone())
    }
}
