//! Raw buffer → luma conversion for the supported V4L2 pixel formats.

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("{format} buffer too short: expected {expected} bytes, got {actual}")]
    Truncated {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::Truncated {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Packed YUYV 4:2:2 (`[Y0, U, Y1, V]`): keep every Y byte.
pub fn yuyv_to_luma(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width as usize) * (height as usize) * 2;
    check_len("YUYV", buf, expected)?;
    Ok(buf[..expected].iter().step_by(2).copied().collect())
}

/// 8-bit grayscale, copied as-is.
pub fn grey_to_luma(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width as usize) * (height as usize);
    check_len("GREY", buf, expected)?;
    Ok(buf[..expected].to_vec())
}

/// 16-bit little-endian grayscale, keeping the high byte.
pub fn y16_to_luma(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width as usize) * (height as usize) * 2;
    check_len("Y16", buf, expected)?;
    Ok(buf[..expected].chunks_exact(2).map(|px| px[1]).collect())
}
