// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::error::{Error, Result};
use core::fmt;
use std::str::FromStr;
use videodev2_sys::{
    FourCC, V4L2_COLORSPACE_SMPTE170M, V4L2_COLORSPACE_SRGB, V4L2_PIX_FMT_BGR24,
    V4L2_PIX_FMT_BGR32, V4L2_PIX_FMT_NV12, V4L2_PIX_FMT_RGB24, V4L2_PIX_FMT_RGB32,
    V4L2_PIX_FMT_UYVY, V4L2_PIX_FMT_YUV420, V4L2_PIX_FMT_YUYV,
};

/// Semantic pixel layouts as named by the media pipeline.
///
/// Not every layout can be handled by the accelerator; [`PixelLayout::to_device`]
/// reports [`Error::UnsupportedFormat`] for those.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    /// Planar YUV 4:2:0
    I420,
    /// Semi-planar YUV 4:2:0
    Nv12,
    /// Packed YUV 4:2:2, Y0 U Y1 V
    Yuy2,
    /// Packed YUV 4:2:2, U Y0 V Y1
    Uyvy,
    /// Packed 24-bit RGB
    Rgb,
    /// Packed 24-bit BGR
    Bgr,
    Argb,
    Xrgb,
    Abgr,
    Xbgr,
    Rgba,
    Bgra,
    Gray8,
}

/// Colorspace codes understood by the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Colorspace {
    /// Broadcast (SDTV) colorspace used for the YUV family
    Smpte170m = V4L2_COLORSPACE_SMPTE170M as isize,
    /// sRGB, used for the RGB family
    Srgb = V4L2_COLORSPACE_SRGB as isize,
}

impl Colorspace {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl PixelLayout {
    /// Layouts the accelerator accepts as its input.
    pub const INPUTS: [PixelLayout; 3] = [PixelLayout::Nv12, PixelLayout::Uyvy, PixelLayout::Yuy2];

    /// Layouts the accelerator can produce.
    pub const OUTPUTS: [PixelLayout; 9] = [
        PixelLayout::Nv12,
        PixelLayout::Uyvy,
        PixelLayout::Yuy2,
        PixelLayout::Argb,
        PixelLayout::Xrgb,
        PixelLayout::Abgr,
        PixelLayout::Xbgr,
        PixelLayout::Rgb,
        PixelLayout::Bgr,
    ];

    pub fn is_yuv(self) -> bool {
        matches!(
            self,
            PixelLayout::I420 | PixelLayout::Nv12 | PixelLayout::Yuy2 | PixelLayout::Uyvy
        )
    }

    /// Maps the layout to the device fourcc and colorspace codes.
    ///
    /// YUV layouts map to the broadcast colorspace, RGB layouts to sRGB.
    pub fn to_device(self) -> Result<(FourCC, Colorspace)> {
        let fourcc = match self {
            PixelLayout::I420 => V4L2_PIX_FMT_YUV420,
            PixelLayout::Nv12 => V4L2_PIX_FMT_NV12,
            PixelLayout::Yuy2 => V4L2_PIX_FMT_YUYV,
            PixelLayout::Uyvy => V4L2_PIX_FMT_UYVY,
            PixelLayout::Rgb => V4L2_PIX_FMT_RGB24,
            PixelLayout::Bgr => V4L2_PIX_FMT_BGR24,
            PixelLayout::Argb | PixelLayout::Xrgb => V4L2_PIX_FMT_RGB32,
            PixelLayout::Abgr | PixelLayout::Xbgr => V4L2_PIX_FMT_BGR32,
            PixelLayout::Rgba | PixelLayout::Bgra | PixelLayout::Gray8 => {
                return Err(Error::UnsupportedFormat(self))
            }
        };
        let colorspace = if self.is_yuv() {
            Colorspace::Smpte170m
        } else {
            Colorspace::Srgb
        };
        Ok((fourcc, colorspace))
    }

    /// Size in bytes of a tightly packed frame in this layout, or `None` if
    /// it does not fit in the address space.
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let w = usize::try_from(width).ok()?;
        let h = usize::try_from(height).ok()?;
        let pixels = w.checked_mul(h)?;
        match self {
            PixelLayout::I420 | PixelLayout::Nv12 => {
                let chroma = w.div_ceil(2).checked_mul(h.div_ceil(2))?.checked_mul(2)?;
                pixels.checked_add(chroma)
            }
            PixelLayout::Yuy2 | PixelLayout::Uyvy => pixels.checked_mul(2),
            PixelLayout::Rgb | PixelLayout::Bgr => pixels.checked_mul(3),
            PixelLayout::Argb
            | PixelLayout::Xrgb
            | PixelLayout::Abgr
            | PixelLayout::Xbgr
            | PixelLayout::Rgba
            | PixelLayout::Bgra => pixels.checked_mul(4),
            PixelLayout::Gray8 => Some(pixels),
        }
    }
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PixelLayout::I420 => "I420",
            PixelLayout::Nv12 => "NV12",
            PixelLayout::Yuy2 => "YUY2",
            PixelLayout::Uyvy => "UYVY",
            PixelLayout::Rgb => "RGB",
            PixelLayout::Bgr => "BGR",
            PixelLayout::Argb => "ARGB",
            PixelLayout::Xrgb => "xRGB",
            PixelLayout::Abgr => "ABGR",
            PixelLayout::Xbgr => "xBGR",
            PixelLayout::Rgba => "RGBA",
            PixelLayout::Bgra => "BGRA",
            PixelLayout::Gray8 => "GRAY8",
        };
        f.write_str(name)
    }
}

impl FromStr for PixelLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "I420" | "YU12" => Ok(PixelLayout::I420),
            "NV12" => Ok(PixelLayout::Nv12),
            "YUY2" | "YUYV" => Ok(PixelLayout::Yuy2),
            "UYVY" => Ok(PixelLayout::Uyvy),
            "RGB" | "RGB3" => Ok(PixelLayout::Rgb),
            "BGR" | "BGR3" => Ok(PixelLayout::Bgr),
            "ARGB" => Ok(PixelLayout::Argb),
            "XRGB" => Ok(PixelLayout::Xrgb),
            "ABGR" => Ok(PixelLayout::Abgr),
            "XBGR" => Ok(PixelLayout::Xbgr),
            "RGBA" => Ok(PixelLayout::Rgba),
            "BGRA" => Ok(PixelLayout::Bgra),
            "GRAY8" => Ok(PixelLayout::Gray8),
            _ => Err(format!("unknown pixel format {s}")),
        }
    }
}

/// Geometry and layout of the frames flowing through one side of the device.
///
/// Derived once per configuration and immutable afterwards.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub fourcc: FourCC,
    pub colorspace: Colorspace,
    pub byte_size: usize,
}

impl FrameFormat {
    pub fn new(width: u32, height: u32, layout: PixelLayout) -> Result<Self> {
        let (fourcc, colorspace) = layout.to_device()?;
        let byte_size = layout
            .frame_size(width, height)
            .filter(|size| u32::try_from(*size).is_ok())
            .ok_or(Error::FrameTooLarge {
                width,
                height,
                layout,
            })?;
        Ok(Self {
            width,
            height,
            layout,
            fourcc,
            colorspace,
            byte_size,
        })
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}x{} {} ({} bytes)",
            self.width, self.height, self.layout, self.byte_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv_maps_to_broadcast_colorspace() {
        for layout in [PixelLayout::I420, PixelLayout::Nv12, PixelLayout::Yuy2, PixelLayout::Uyvy] {
            let (_, colorspace) = layout.to_device().unwrap();
            assert_eq!(colorspace, Colorspace::Smpte170m, "{layout}");
        }
        assert_eq!(
            PixelLayout::Yuy2.to_device().unwrap().0,
            V4L2_PIX_FMT_YUYV
        );
    }

    #[test]
    fn rgb_maps_to_srgb() {
        assert_eq!(
            PixelLayout::Xrgb.to_device().unwrap(),
            (V4L2_PIX_FMT_RGB32, Colorspace::Srgb)
        );
        assert_eq!(
            PixelLayout::Abgr.to_device().unwrap(),
            (V4L2_PIX_FMT_BGR32, Colorspace::Srgb)
        );
        assert_eq!(
            PixelLayout::Bgr.to_device().unwrap(),
            (V4L2_PIX_FMT_BGR24, Colorspace::Srgb)
        );
    }

    #[test]
    fn unsupported_layouts() {
        for layout in [PixelLayout::Rgba, PixelLayout::Bgra, PixelLayout::Gray8] {
            assert!(matches!(
                layout.to_device(),
                Err(Error::UnsupportedFormat(l)) if l == layout
            ));
        }
    }

    #[test]
    fn frame_sizes() {
        assert_eq!(FrameFormat::new(1920, 1080, PixelLayout::Nv12).unwrap().byte_size, 3110400);
        assert_eq!(FrameFormat::new(1920, 1080, PixelLayout::Yuy2).unwrap().byte_size, 4147200);
        assert_eq!(FrameFormat::new(1920, 1080, PixelLayout::Rgb).unwrap().byte_size, 6220800);
        assert_eq!(FrameFormat::new(1920, 1080, PixelLayout::Xrgb).unwrap().byte_size, 8294400);
        // odd dimensions round the chroma planes up
        assert_eq!(PixelLayout::I420.frame_size(3, 3), Some(9 + 2 * 4));
    }

    #[test]
    fn oversized_frames_rejected() {
        assert!(matches!(
            FrameFormat::new(u32::MAX, u32::MAX, PixelLayout::Xrgb),
            Err(Error::FrameTooLarge {
                layout: PixelLayout::Xrgb,
                ..
            })
        ));
        // 6.4 GB does not fit the 32-bit image size the device reports.
        assert!(matches!(
            FrameFormat::new(40000, 40000, PixelLayout::Argb),
            Err(Error::FrameTooLarge { width: 40000, .. })
        ));
        assert_eq!(PixelLayout::Gray8.frame_size(u32::MAX, 1), Some(u32::MAX as usize));
        assert!(FrameFormat::new(16384, 16384, PixelLayout::Nv12).is_ok());
    }

    #[test]
    fn parse_pipeline_names() {
        assert_eq!("YUY2".parse(), Ok(PixelLayout::Yuy2));
        assert_eq!("yuyv".parse(), Ok(PixelLayout::Yuy2));
        assert_eq!("xRGB".parse(), Ok(PixelLayout::Xrgb));
        assert!("P010".parse::<PixelLayout>().is_err());
        for layout in PixelLayout::OUTPUTS {
            assert_eq!(layout.to_string().parse(), Ok(layout));
        }
    }
}
