//! FFmpeg filter graphs for reframed output.

use reframe_models::{AspectRatio, CropWindow};

/// Output label used by [`letterbox_filter`].
pub const LETTERBOX_OUTPUT: &str = "[vout]";

/// Output frame size for a render.
///
/// An explicit `resolution` wins; otherwise the crop size is used. With
/// `even` set both dimensions are rounded down to even values, which
/// yuv420p H.264 requires.
pub fn output_size(crop: &CropWindow, resolution: Option<(u32, u32)>, even: bool) -> (u32, u32) {
    let (w, h) = resolution.unwrap_or((crop.width.max(1) as u32, crop.height.max(1) as u32));
    if even {
        (round_even(w), round_even(h))
    } else {
        (w, h)
    }
}

/// Canvas size for letterboxed output.
///
/// An explicit `resolution` wins; otherwise the canvas takes the crop's
/// height and the target ratio's width, so the fitted crop leaves blurred
/// bands wherever its own ratio differs from the target.
pub fn letterbox_size(crop: &CropWindow, aspect: AspectRatio, resolution: Option<(u32, u32)>, even: bool) -> (u32, u32) {
    if resolution.is_some() {
        return output_size(crop, resolution, even);
    }
    let height = crop.height.max(1) as u32;
    let width = ((height as f64 * aspect.ratio()).round() as u32).max(1);
    if even {
        (round_even(width), round_even(height))
    } else {
        (width, height)
    }
}

fn round_even(value: u32) -> u32 {
    (value / 2 * 2).max(2)
}

/// Crop followed by a Lanczos scale to the output size.
pub fn crop_scale_filter(crop: &CropWindow, out_width: u32, out_height: u32) -> String {
    format!(
        "crop={}:{}:{}:{},scale={}:{}:flags=lanczos,setsar=1",
        crop.width, crop.height, crop.x, crop.y, out_width, out_height
    )
}

/// Same as [`crop_scale_filter`] with timestamps reset, for segments that
/// are concatenated afterwards.
pub fn segment_filter(crop: &CropWindow, out_width: u32, out_height: u32) -> String {
    format!(
        "crop={}:{}:{}:{},setpts=PTS-STARTPTS,scale={}:{}:flags=lanczos,setsar=1",
        crop.width, crop.height, crop.x, crop.y, out_width, out_height
    )
}

/// Sharp crop fitted inside the output canvas over a blurred copy of the full frame.
///
/// Produces a `-filter_complex` graph ending in [`LETTERBOX_OUTPUT`].
pub fn letterbox_filter(crop: &CropWindow, out_width: u32, out_height: u32, blur_sigma: f64, reset_pts: bool) -> String {
    let pts = if reset_pts { "setpts=PTS-STARTPTS," } else { "" };
    format!(
        "[0:v]{pts}scale={ow}:{oh}:force_original_aspect_ratio=increase,\
         crop={ow}:{oh},\
         gblur=sigma={sigma},\
         setsar=1[bg];\
         [0:v]{pts}crop={w}:{h}:{x}:{y},\
         scale={ow}:{oh}:force_original_aspect_ratio=decrease:flags=lanczos,\
         setsar=1[fg];\
         [bg][fg]overlay=(W-w)/2:(H-h)/2,format=yuv420p{out}",
        pts = pts,
        ow = out_width,
        oh = out_height,
        sigma = blur_sigma,
        w = crop.width,
        h = crop.height,
        x = crop.x,
        y = crop.y,
        out = LETTERBOX_OUTPUT,
    )
}
