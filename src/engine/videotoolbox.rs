//! VideoToolbox hardware H.264 decoder for macOS.
//!
//! Frames are decoded asynchronously into IOSurface-backed `CVPixelBuffer`s
//! (NV12 or P010, Metal compatible). A decoded buffer is retained and handed
//! to the session as a [`PlatformBuffer`]; its IOSurface id can be imported
//! as a Metal texture per plane without copying.

use std::collections::HashMap;
use std::ptr;

use core_foundation::base::{CFRelease, CFTypeRef, TCFType};
use core_foundation::boolean::CFBoolean;
use core_foundation::dictionary::CFDictionary;
use core_foundation::number::CFNumber;
use core_foundation::string::CFString;
use core_foundation_sys::base::OSStatus;
use core_media_sys::CMTime;
use libc::c_void;
use parking_lot::Mutex;
use video_toolbox_sys::cv_types::CVPixelBufferRef;
use video_toolbox_sys::decompression::{
    VTDecompressionOutputCallbackRecord, VTDecompressionSessionCreate,
    VTDecompressionSessionDecodeFrame, VTDecompressionSessionInvalidate, VTDecompressionSessionRef,
};
use vpreview_codec::{
    catch_platform, copy_plane, plane_sizes, CompressedSample, Completion, CompletionSink,
    CpuImage, DecodeEngine, DecodeError, EngineSession, FormatConfig, FrameToken, NativeTexture,
    PixelFormat, PlatformBuffer,
};

/// `kCMVideoCodecType_H264` = FourCC `'avc1'`
const K_CM_VIDEO_CODEC_TYPE_H264: u32 = 0x61766331;
/// `kCVPixelFormatType_420YpCbCr8BiPlanarVideoRange` (NV12)
const PIXEL_FMT_NV12: i32 = 0x34323076;
/// `kCVPixelFormatType_420YpCbCr10BiPlanarVideoRange` (P010-compatible)
const PIXEL_FMT_P010: i32 = 0x78343230u32 as i32;
/// `kVTDecodeFrame_EnableAsynchronousDecompression`
const K_VT_DECODE_FRAME_ENABLE_ASYNC: u32 = 1 << 0;
/// `kVTDecodeInfo_FrameDropped`
const K_VT_DECODE_INFO_FRAME_DROPPED: u32 = 1 << 1;
/// `kCMBlockBufferAssureMemoryNowFlag`
const K_CM_BLOCK_BUFFER_ASSURE_MEMORY_NOW: u32 = 1 << 0;
/// `kCVPixelBufferLock_ReadOnly`
const K_CV_PIXEL_BUFFER_LOCK_READ_ONLY: u64 = 1;

// ── CoreMedia FFI ──────────────────────────────────────────────────────

#[link(name = "CoreMedia", kind = "framework")]
extern "C" {
    fn CMVideoFormatDescriptionCreateFromH264ParameterSets(
        allocator: *const c_void,
        parameter_set_count: usize,
        parameter_set_pointers: *const *const u8,
        parameter_set_sizes: *const usize,
        nal_unit_header_length: i32,
        format_description_out: *mut *mut c_void,
    ) -> OSStatus;

    fn CMSampleBufferCreate(
        allocator: *const c_void,
        data_buffer: *const c_void,
        data_ready: bool,
        make_data_ready_callback: *const c_void,
        make_data_ready_refcon: *const c_void,
        format_description: *const c_void,
        num_samples: i64,
        num_sample_timing_entries: i64,
        sample_timing_array: *const CMSampleTimingInfo,
        num_sample_size_entries: i64,
        sample_size_array: *const usize,
        sample_buffer_out: *mut *mut c_void,
    ) -> OSStatus;

    fn CMBlockBufferCreateWithMemoryBlock(
        allocator: *const c_void,
        memory_block: *mut c_void,
        block_length: usize,
        block_allocator: *const c_void,
        custom_block_source: *const c_void,
        offset_to_data: usize,
        data_length: usize,
        flags: u32,
        block_buffer_out: *mut *mut c_void,
    ) -> OSStatus;

    fn CMBlockBufferReplaceDataBytes(
        source_bytes: *const c_void,
        destination_buffer: *mut c_void,
        offset_into_destination: usize,
        data_length: usize,
    ) -> OSStatus;
}

// ── CoreVideo / IOSurface FFI ──────────────────────────────────────────

#[link(name = "CoreVideo", kind = "framework")]
extern "C" {
    fn CVPixelBufferRetain(pixel_buffer: CVPixelBufferRef) -> CVPixelBufferRef;
    fn CVPixelBufferRelease(pixel_buffer: CVPixelBufferRef);
    fn CVPixelBufferLockBaseAddress(pixel_buffer: CVPixelBufferRef, flags: u64) -> i32;
    fn CVPixelBufferUnlockBaseAddress(pixel_buffer: CVPixelBufferRef, flags: u64) -> i32;
    fn CVPixelBufferGetWidth(pixel_buffer: CVPixelBufferRef) -> usize;
    fn CVPixelBufferGetHeight(pixel_buffer: CVPixelBufferRef) -> usize;
    fn CVPixelBufferGetPlaneCount(pixel_buffer: CVPixelBufferRef) -> usize;
    fn CVPixelBufferGetBaseAddressOfPlane(buf: CVPixelBufferRef, idx: usize) -> *mut c_void;
    fn CVPixelBufferGetBytesPerRowOfPlane(buf: CVPixelBufferRef, idx: usize) -> usize;
    fn CVPixelBufferGetHeightOfPlane(buf: CVPixelBufferRef, idx: usize) -> usize;
    fn CVPixelBufferGetIOSurface(pixel_buffer: CVPixelBufferRef) -> *mut c_void;
}

#[link(name = "IOSurface", kind = "framework")]
extern "C" {
    fn IOSurfaceGetID(surface: *mut c_void) -> u32;
}

// ── VideoToolbox FFI (not in video-toolbox-sys) ───────────────────────

#[link(name = "VideoToolbox", kind = "framework")]
extern "C" {
    fn VTDecompressionSessionWaitForAsynchronousFrames(
        session: VTDecompressionSessionRef,
    ) -> OSStatus;
    fn VTDecompressionSessionFinishDelayedFrames(session: VTDecompressionSessionRef) -> OSStatus;
    fn VTIsHardwareDecodeSupported(codec_type: u32) -> u8;
}

#[repr(C)]
#[derive(Copy, Clone)]
struct CMSampleTimingInfo {
    duration: CMTime,
    presentation_time_stamp: CMTime,
    decode_time_stamp: CMTime,
}

fn cm_time(value: i64, timescale: u32) -> CMTime {
    CMTime {
        value,
        timescale: timescale as i32,
        flags: 1,
        epoch: 0,
    }
}

/// Owned CoreFoundation object, released on drop.
struct CfHandle(*mut c_void);

impl Drop for CfHandle {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { CFRelease(self.0 as CFTypeRef) };
        }
    }
}

/// Whether this machine decodes H.264 in hardware.
pub fn is_available() -> bool {
    unsafe { VTIsHardwareDecodeSupported(K_CM_VIDEO_CODEC_TYPE_H264) != 0 }
}

// ── Pixel buffers ──────────────────────────────────────────────────────

/// A retained `CVPixelBuffer`.
pub struct PixelBuffer {
    raw: CVPixelBufferRef,
    format: PixelFormat,
}

// CVPixelBuffer retain/release is thread-safe, and the buffer is only read.
unsafe impl Send for PixelBuffer {}
unsafe impl Sync for PixelBuffer {}

impl PixelBuffer {
    /// Take a new reference to `raw`.
    ///
    /// # Safety
    /// `raw` must be a valid, non-null `CVPixelBufferRef`.
    unsafe fn retain(raw: CVPixelBufferRef, format: PixelFormat) -> Self {
        CVPixelBufferRetain(raw);
        Self { raw, format }
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        unsafe { CVPixelBufferRelease(self.raw) };
    }
}

struct BaseAddressLock(CVPixelBufferRef);

impl BaseAddressLock {
    fn new(raw: CVPixelBufferRef) -> Result<Self, DecodeError> {
        let st = unsafe { CVPixelBufferLockBaseAddress(raw, K_CV_PIXEL_BUFFER_LOCK_READ_ONLY) };
        if st != 0 {
            return Err(DecodeError::decode_failed(
                0,
                format!("[vtdec] CVPixelBufferLockBaseAddress failed: {st}"),
            ));
        }
        Ok(Self(raw))
    }
}

impl Drop for BaseAddressLock {
    fn drop(&mut self) {
        unsafe { CVPixelBufferUnlockBaseAddress(self.0, K_CV_PIXEL_BUFFER_LOCK_READ_ONLY) };
    }
}

impl PlatformBuffer for PixelBuffer {
    fn width(&self) -> u32 {
        unsafe { CVPixelBufferGetWidth(self.raw) as u32 }
    }

    fn height(&self) -> u32 {
        unsafe { CVPixelBufferGetHeight(self.raw) as u32 }
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn export_native(&self) -> Result<NativeTexture, DecodeError> {
        unsafe {
            let surface = CVPixelBufferGetIOSurface(self.raw);
            if surface.is_null() {
                return Err(DecodeError::UnsupportedZeroCopy);
            }
            Ok(NativeTexture::IoSurface {
                surface_id: IOSurfaceGetID(surface),
                planes: CVPixelBufferGetPlaneCount(self.raw) as u32,
            })
        }
    }

    fn read_planes(&self) -> Result<CpuImage, DecodeError> {
        let width = self.width();
        let height = self.height();
        let (y_len, uv_len) = plane_sizes(width, height, self.format);
        let y_rows = height as usize;
        let uv_rows = (height as usize).div_ceil(2);

        let _lock = BaseAddressLock::new(self.raw)?;
        let mut planes = Vec::with_capacity(2);
        for (idx, rows, len) in [(0, y_rows, y_len), (1, uv_rows, uv_len)] {
            unsafe {
                let base = CVPixelBufferGetBaseAddressOfPlane(self.raw, idx);
                if base.is_null() {
                    return Err(DecodeError::decode_failed(
                        0,
                        format!("[vtdec] plane {idx} has no base address"),
                    ));
                }
                let stride = CVPixelBufferGetBytesPerRowOfPlane(self.raw, idx);
                let plane_rows = CVPixelBufferGetHeightOfPlane(self.raw, idx).min(rows);
                let src = std::slice::from_raw_parts(base as *const u8, stride * plane_rows);
                planes.push(copy_plane(src, stride, len / rows.max(1), plane_rows)?);
            }
        }
        let uv = planes.pop().unwrap_or_default();
        let y = planes.pop().unwrap_or_default();
        CpuImage::new(width, height, self.format, y, uv)
    }
}

// ── Engine ─────────────────────────────────────────────────────────────

/// VideoToolbox H.264 engine.
#[derive(Debug, Default)]
pub struct VideoToolboxEngine;

impl VideoToolboxEngine {
    pub fn new() -> Self {
        Self
    }
}

impl DecodeEngine for VideoToolboxEngine {
    fn name(&self) -> &'static str {
        "videotoolbox"
    }

    fn supports_zero_copy(&self) -> bool {
        true
    }

    fn create_session(
        &self,
        format: &FormatConfig,
        pixel_format: PixelFormat,
        sink: CompletionSink,
    ) -> Result<Box<dyn EngineSession>, DecodeError> {
        Ok(Box::new(VtSession::new(format, pixel_format, sink)?))
    }
}

/// State reachable from the decode callback: only tokens and the sink.
struct CallbackContext {
    sink: CompletionSink,
    pending: Mutex<HashMap<u64, FrameToken>>,
    pixel_format: PixelFormat,
}

impl CallbackContext {
    fn complete(&self, sequence: u64, status: OSStatus, info_flags: u32, image: CVPixelBufferRef) {
        let Some(token) = self.pending.lock().remove(&sequence) else {
            tracing::debug!("[vtdec] callback for unknown sample {sequence}");
            return;
        };
        let result = if status != 0 {
            Err(DecodeError::decode_failed(
                sequence,
                format!("decoder status {status}"),
            ))
        } else if info_flags & K_VT_DECODE_INFO_FRAME_DROPPED != 0 || image.is_null() {
            Err(DecodeError::decode_failed(sequence, "frame dropped"))
        } else {
            let buffer = unsafe { PixelBuffer::retain(image, self.pixel_format) };
            Ok(Box::new(buffer) as Box<dyn PlatformBuffer>)
        };
        self.sink.deliver(Completion { token, result });
    }
}

/// One `VTDecompressionSession`.
pub struct VtSession {
    session: VTDecompressionSessionRef,
    format_desc: CfHandle,
    context: Box<CallbackContext>,
}

unsafe impl Send for VtSession {}

impl VtSession {
    fn new(
        format: &FormatConfig,
        pixel_format: PixelFormat,
        sink: CompletionSink,
    ) -> Result<Self, DecodeError> {
        let sets: Vec<&[u8]> = format
            .sps
            .iter()
            .chain(format.pps.iter())
            .map(|s| s.as_ref())
            .collect();
        let pointers: Vec<*const u8> = sets.iter().map(|s| s.as_ptr()).collect();
        let sizes: Vec<usize> = sets.iter().map(|s| s.len()).collect();

        let mut fmt_desc: *mut c_void = ptr::null_mut();
        let st = unsafe {
            CMVideoFormatDescriptionCreateFromH264ParameterSets(
                ptr::null(),
                pointers.len(),
                pointers.as_ptr(),
                sizes.as_ptr(),
                format.nal_length_size as i32,
                &mut fmt_desc,
            )
        };
        if st != 0 {
            return Err(DecodeError::session_create(format!(
                "[vtdec] CMVideoFormatDescriptionCreateFromH264ParameterSets failed: {st}"
            )));
        }
        let format_desc = CfHandle(fmt_desc);

        let pixel_fmt = match pixel_format {
            PixelFormat::Nv12 => PIXEL_FMT_NV12,
            PixelFormat::P010 => PIXEL_FMT_P010,
        };

        // Destination pixel buffer attributes
        let pf_key = CFString::new("PixelFormatType");
        let pf_val = CFNumber::from(pixel_fmt);
        let ios_key = CFString::new("IOSurfaceProperties");
        let empty: Vec<(CFString, CFString)> = Vec::new();
        let ios_val = CFDictionary::from_CFType_pairs(&empty);
        let metal_key = CFString::new("MetalCompatibility");
        let dest = CFDictionary::from_CFType_pairs(&[
            (pf_key.as_CFType(), pf_val.as_CFType()),
            (ios_key.as_CFType(), ios_val.as_CFType()),
            (metal_key.as_CFType(), CFBoolean::true_value().as_CFType()),
        ]);

        let hw_key = CFString::new("EnableHardwareAcceleratedVideoDecoder");
        let decoder_spec = CFDictionary::from_CFType_pairs(&[(
            hw_key.as_CFType(),
            CFBoolean::true_value().as_CFType(),
        )]);

        let context = Box::new(CallbackContext {
            sink,
            pending: Mutex::new(HashMap::new()),
            pixel_format,
        });
        let cb = VTDecompressionOutputCallbackRecord {
            decompressionOutputCallback: vt_h264_callback,
            decompressionOutputRefCon: &*context as *const CallbackContext as *mut c_void,
        };

        let mut session: VTDecompressionSessionRef = ptr::null_mut();
        let st = unsafe {
            VTDecompressionSessionCreate(
                ptr::null(),
                format_desc.0 as *mut _,
                decoder_spec.as_concrete_TypeRef() as *const _,
                dest.as_concrete_TypeRef() as *const _,
                &cb,
                &mut session,
            )
        };
        if st != 0 {
            return Err(DecodeError::session_create(format!(
                "[vtdec] VTDecompressionSessionCreate failed: {st}"
            )));
        }

        tracing::info!(
            "[vtdec] session: {}x{}, pixel_fmt=0x{:08x}, nal_len={}",
            format.width,
            format.height,
            pixel_fmt as u32,
            format.nal_length_size
        );
        Ok(Self {
            session,
            format_desc,
            context,
        })
    }

    fn decode(&mut self, sample: &CompressedSample) -> Result<(), DecodeError> {
        let sequence = sample.sequence;
        let len = sample.data.len();

        unsafe {
            // CoreMedia owns the block memory; the sample bytes are copied in.
            let mut block_buf: *mut c_void = ptr::null_mut();
            let st = CMBlockBufferCreateWithMemoryBlock(
                ptr::null(),
                ptr::null_mut(),
                len,
                ptr::null(),
                ptr::null(),
                0,
                len,
                K_CM_BLOCK_BUFFER_ASSURE_MEMORY_NOW,
                &mut block_buf,
            );
            if st != 0 {
                return Err(DecodeError::submit_failed(
                    sequence,
                    format!("[vtdec] CMBlockBufferCreate failed: {st}"),
                ));
            }
            let block_buf = CfHandle(block_buf);
            let st = CMBlockBufferReplaceDataBytes(
                sample.data.as_ptr() as *const c_void,
                block_buf.0,
                0,
                len,
            );
            if st != 0 {
                return Err(DecodeError::submit_failed(
                    sequence,
                    format!("[vtdec] CMBlockBufferReplaceDataBytes failed: {st}"),
                ));
            }

            let timing = CMSampleTimingInfo {
                duration: cm_time(sample.duration as i64, sample.timescale),
                presentation_time_stamp: cm_time(sample.pts, sample.timescale),
                decode_time_stamp: cm_time(sample.dts, sample.timescale),
            };
            let mut sample_buf: *mut c_void = ptr::null_mut();
            let st = CMSampleBufferCreate(
                ptr::null(),
                block_buf.0,
                true,
                ptr::null(),
                ptr::null(),
                self.format_desc.0,
                1,
                1,
                &timing,
                1,
                &len,
                &mut sample_buf,
            );
            if st != 0 {
                return Err(DecodeError::submit_failed(
                    sequence,
                    format!("[vtdec] CMSampleBufferCreate failed: {st}"),
                ));
            }
            let sample_buf = CfHandle(sample_buf);

            let mut info_flags: u32 = 0;
            let st = VTDecompressionSessionDecodeFrame(
                self.session,
                sample_buf.0 as *mut _,
                K_VT_DECODE_FRAME_ENABLE_ASYNC,
                sequence as usize as *mut c_void,
                &mut info_flags,
            );
            if st != 0 {
                return Err(DecodeError::submit_failed(
                    sequence,
                    format!("[vtdec] decode failed: status={st}, flags=0x{info_flags:x}"),
                ));
            }
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if !self.session.is_null() {
            unsafe {
                VTDecompressionSessionInvalidate(self.session);
                CFRelease(self.session as CFTypeRef);
            }
            self.session = ptr::null_mut();
        }
        let abandoned = {
            let mut pending = self.context.pending.lock();
            let n = pending.len();
            pending.clear();
            n
        };
        if abandoned > 0 {
            tracing::debug!("[vtdec] invalidated with {abandoned} frames pending");
        }
    }
}

impl EngineSession for VtSession {
    fn submit(&mut self, token: FrameToken, sample: &CompressedSample) -> Result<(), DecodeError> {
        if self.session.is_null() {
            return Err(DecodeError::submit_failed(token.sequence, "[vtdec] session invalidated"));
        }
        self.context.pending.lock().insert(token.sequence, token);
        let result = self.decode(sample);
        if result.is_err() {
            self.context.pending.lock().remove(&token.sequence);
        }
        result
    }

    fn wait_for_async_completions(&mut self) -> Result<(), DecodeError> {
        if self.session.is_null() {
            return Ok(());
        }
        let st = unsafe {
            VTDecompressionSessionFinishDelayedFrames(self.session);
            VTDecompressionSessionWaitForAsynchronousFrames(self.session)
        };
        if st != 0 {
            return Err(DecodeError::decode_failed(
                0,
                format!("[vtdec] WaitForAsynchronousFrames failed: {st}"),
            ));
        }
        Ok(())
    }

    fn invalidate(&mut self) {
        self.teardown();
    }
}

impl Drop for VtSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ── VT decompression callback ──────────────────────────────────────────

extern "C" fn vt_h264_callback(
    ref_con: *mut c_void,
    source_frame_ref_con: *mut c_void,
    status: OSStatus,
    info_flags: u32,
    image_buffer: CVPixelBufferRef,
    _pts: CMTime,
    _dur: CMTime,
) {
    if ref_con.is_null() {
        return;
    }
    let context = unsafe { &*(ref_con as *const CallbackContext) };
    let sequence = source_frame_ref_con as usize as u64;
    // A panic must not unwind into VideoToolbox.
    let _ = catch_platform(
        || {
            context.complete(sequence, status, info_flags, image_buffer);
            Ok(())
        },
        |msg| DecodeError::decode_failed(sequence, msg),
    );
}
