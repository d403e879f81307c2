//! Frame storage and raw video frames.

use bytes::{Bytes, BytesMut};

use crate::types::{align_up, PicStruct, PixelFormat, Rational};
use crate::CodecError;

/// CPU-visible pixel storage with per-plane layout.
///
/// Luma rows are stored at `pitch` bytes per row for `rows` rows, followed by
/// the chroma plane(s). `rows` may exceed `height` when the provider pads the
/// allocation.
///
/// Clones share the storage. Writing through [`FrameBuffer::modify`] copies it
/// first when it is shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    format: PixelFormat,
    width: u32,
    height: u32,
    pitch: usize,
    rows: usize,
    data: Bytes,
}

impl FrameBuffer {
    /// Wraps existing storage. Fails if `data` is too short for the layout.
    pub fn from_parts(
        format: PixelFormat,
        width: u32,
        height: u32,
        pitch: usize,
        rows: usize,
        data: impl Into<Bytes>,
    ) -> Result<Self, CodecError> {
        let data = data.into();
        if pitch < width as usize || rows < height as usize {
            return Err(CodecError::invalid_param(format!(
                "pitch {pitch} / rows {rows} too small for {width}x{height}"
            )));
        }
        let needed = storage_size(format, pitch, rows);
        if data.len() < needed {
            return Err(CodecError::invalid_param(format!(
                "{:?} storage too small: expected {}, got {}",
                format,
                needed,
                data.len()
            )));
        }
        Ok(Self {
            format,
            width,
            height,
            pitch,
            rows,
            data,
        })
    }

    /// Tightly packed buffer (pitch == width, rows == height).
    pub fn packed(format: PixelFormat, width: u32, height: u32, data: impl Into<Bytes>) -> Result<Self, CodecError> {
        Self::from_parts(format, width, height, width as usize, height as usize, data)
    }

    #[must_use]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Luma stride in bytes.
    #[must_use]
    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// Allocated luma rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Run `f` over writable storage.
    pub fn modify<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = match std::mem::take(&mut self.data).try_into_mut() {
            Ok(data) => data,
            Err(shared) => BytesMut::from(&shared[..]),
        };
        let out = f(&mut data);
        self.data = data.freeze();
        out
    }

    /// Luma plane.
    #[must_use]
    pub fn luma(&self) -> &[u8] {
        &self.data[..self.pitch * self.rows]
    }

    /// Chroma plane(s) following the luma plane.
    #[must_use]
    pub fn chroma(&self) -> &[u8] {
        let start = self.pitch * self.rows;
        &self.data[start..storage_size(self.format, self.pitch, self.rows)]
    }

    /// Whether the device can read this buffer in place for encoding.
    #[must_use]
    pub fn is_encode_aligned(&self) -> bool {
        let rows = align_up(self.height, 32) as usize;
        self.pitch % 16 == 0 && self.data.len() >= self.pitch * rows
    }

    /// Copies the visible picture into `dst`, converting I420 to NV12 when needed.
    pub fn copy_into(&self, dst: &mut FrameBuffer) -> Result<(), CodecError> {
        if dst.format != PixelFormat::Nv12 {
            return Err(CodecError::unsupported(format!("copy into {:?}", dst.format)));
        }
        if dst.width < self.width || dst.height < self.height {
            return Err(CodecError::invalid_param(format!(
                "destination {}x{} smaller than {}x{}",
                dst.width, dst.height, self.width, self.height
            )));
        }

        let w = self.width as usize;
        let h = self.height as usize;
        let src = &self.data;
        let dst_pitch = dst.pitch;
        let dst_uv = dst.pitch * dst.rows;
        dst.modify(|out| {
            for row in 0..h {
                let line = &src[row * self.pitch..row * self.pitch + w];
                out[row * dst_pitch..row * dst_pitch + w].copy_from_slice(line);
            }

            match self.format {
                PixelFormat::Nv12 => {
                    let src_uv = self.pitch * self.rows;
                    for row in 0..h / 2 {
                        let line = &src[src_uv + row * self.pitch..src_uv + row * self.pitch + w];
                        let at = dst_uv + row * dst_pitch;
                        out[at..at + w].copy_from_slice(line);
                    }
                }
                PixelFormat::I420 => {
                    let chroma_pitch = self.pitch / 2;
                    let u_plane = self.pitch * self.rows;
                    let v_plane = u_plane + chroma_pitch * self.rows / 2;
                    for row in 0..h / 2 {
                        for col in 0..w / 2 {
                            let at = dst_uv + row * dst_pitch + col * 2;
                            out[at] = src[u_plane + row * chroma_pitch + col];
                            out[at + 1] = src[v_plane + row * chroma_pitch + col];
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

/// Bytes needed for a buffer with the given layout.
#[must_use]
pub fn storage_size(format: PixelFormat, pitch: usize, rows: usize) -> usize {
    match format {
        // Y + interleaved UV at full pitch, or Y + U + V at half pitch.
        PixelFormat::Nv12 | PixelFormat::I420 => pitch * rows + pitch * rows / 2,
    }
}

/// Calculate expected tightly packed frame size for given dimensions and format.
#[must_use]
pub fn expected_frame_size(width: u32, height: u32, format: PixelFormat) -> usize {
    storage_size(format, width as usize, height as usize)
}

/// A raw video frame: decoder output, or encoder input.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Pixel storage.
    pub buffer: FrameBuffer,
    /// Presentation timestamp, `None` when unknown.
    pub pts: Option<i64>,
    /// Decode timestamp, `None` when unknown.
    pub dts: Option<i64>,
    /// Extra field periods to display (0, 1, 2 or 4).
    pub repeat_pict: u8,
    pub top_field_first: bool,
    pub interlaced: bool,
    pub sample_aspect_ratio: Rational,
}

impl VideoFrame {
    /// Create a progressive frame around `buffer`.
    #[must_use]
    pub fn new(buffer: FrameBuffer, pts: Option<i64>) -> Self {
        Self {
            buffer,
            pts,
            dts: None,
            repeat_pict: 0,
            top_field_first: false,
            interlaced: false,
            sample_aspect_ratio: Rational::new(1, 1),
        }
    }

    /// Create a frame from tightly packed NV12 data.
    pub fn from_nv12(width: u32, height: u32, data: Vec<u8>, pts: Option<i64>) -> Result<Self, CodecError> {
        Ok(Self::new(FrameBuffer::packed(PixelFormat::Nv12, width, height, data)?, pts))
    }

    /// Create a frame from tightly packed I420 data.
    pub fn from_i420(width: u32, height: u32, data: Vec<u8>, pts: Option<i64>) -> Result<Self, CodecError> {
        Ok(Self::new(FrameBuffer::packed(PixelFormat::I420, width, height, data)?, pts))
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    /// Picture structure matching the interlacing flags of this frame.
    #[must_use]
    pub fn pic_struct(&self) -> PicStruct {
        PicStruct::for_frame(self.interlaced, self.top_field_first, self.repeat_pict)
    }

    /// Apply the interlacing flags derived from a device picture structure.
    pub fn apply_pic_struct(&mut self, pic_struct: PicStruct) {
        self.repeat_pict = pic_struct.repeat_pict();
        self.top_field_first = pic_struct.top_field_first();
        self.interlaced = pic_struct.interlaced();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_frame_size() {
        assert_eq!(expected_frame_size(1920, 1080, PixelFormat::Nv12), 1920 * 1080 * 3 / 2);
        assert_eq!(expected_frame_size(4, 4, PixelFormat::I420), 24);
    }

    #[test]
    fn test_from_parts_rejects_short_storage() {
        assert!(FrameBuffer::from_parts(PixelFormat::Nv12, 4, 4, 4, 4, vec![0; 23]).is_err());
        assert!(FrameBuffer::from_parts(PixelFormat::Nv12, 4, 4, 2, 4, vec![0; 64]).is_err());
    }

    #[test]
    fn test_encode_alignment() {
        let tight = FrameBuffer::packed(PixelFormat::Nv12, 20, 20, vec![0; 600]).unwrap();
        assert!(!tight.is_encode_aligned());

        let padded = FrameBuffer::from_parts(PixelFormat::Nv12, 20, 20, 32, 32, vec![0; 32 * 48]).unwrap();
        assert!(padded.is_encode_aligned());
    }

    #[test]
    fn test_i420_copy_interleaves_chroma() {
        // 4x4 I420 frame
        let y_plane: Vec<u8> = vec![16; 16];
        let u_plane: Vec<u8> = vec![100; 4];
        let v_plane: Vec<u8> = vec![200; 4];

        let mut i420 = y_plane.clone();
        i420.extend(&u_plane);
        i420.extend(&v_plane);
        let src = FrameBuffer::packed(PixelFormat::I420, 4, 4, i420).unwrap();

        let mut dst = FrameBuffer::from_parts(PixelFormat::Nv12, 4, 4, 16, 32, vec![0; 16 * 48]).unwrap();
        src.copy_into(&mut dst).unwrap();

        assert_eq!(&dst.luma()[..4], &[16, 16, 16, 16]);
        assert_eq!(&dst.luma()[16..20], &[16, 16, 16, 16]);
        let chroma = dst.chroma();
        assert_eq!(&chroma[..4], &[100, 200, 100, 200]);
        assert_eq!(&chroma[16..20], &[100, 200, 100, 200]);
    }

    #[test]
    fn test_clones_share_storage_until_written() {
        let original = FrameBuffer::packed(PixelFormat::Nv12, 4, 4, vec![5; 24]).unwrap();
        let mut copy = original.clone();
        assert_eq!(copy.data().as_ptr(), original.data().as_ptr());

        copy.modify(|data| data.fill(9));
        assert_ne!(copy.data().as_ptr(), original.data().as_ptr());
        assert!(original.data().iter().all(|&b| b == 5));
        assert!(copy.data().iter().all(|&b| b == 9));
    }

    #[test]
    fn test_pic_struct_roundtrip_on_frame() {
        let buffer = FrameBuffer::packed(PixelFormat::Nv12, 2, 2, vec![0; 6]).unwrap();
        let mut frame = VideoFrame::new(buffer, Some(0));
        frame.apply_pic_struct(PicStruct::FIELD_TFF | PicStruct::FIELD_REPEATED);
        assert!(frame.interlaced);
        assert!(frame.top_field_first);
        assert_eq!(frame.repeat_pict, 1);
        assert_eq!(frame.pic_struct(), PicStruct::FIELD_TFF | PicStruct::FIELD_REPEATED);
    }
}
