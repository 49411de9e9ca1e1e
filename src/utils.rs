use image::{DynamicImage, ImageFormat};
use indicatif::ProgressStyle;
use rand::Rng;

use crate::error::{Error, Result};

const IMAGE_ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const IMAGE_ID_SUFFIX_LEN: usize = 7;

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {per_sec} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// 解码图片，失败时视为非法请求
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| Error::validation(format!("无法解码图片: {e}")))
}

/// 根据文件头猜测图片的扩展名
pub fn image_extension(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or_else(|| ImageFormat::Jpeg.extensions_str()[0])
}

/// 生成新的图片 ID，格式为 `item_id` 加 7 位大写字母或数字
pub fn generate_image_id(item_id: &str) -> String {
    let mut rng = rand::rng();
    let suffix = (0..IMAGE_ID_SUFFIX_LEN)
        .map(|_| IMAGE_ID_CHARSET[rng.random_range(0..IMAGE_ID_CHARSET.len())] as char)
        .collect::<String>();
    format!("{item_id}{suffix}")
}
