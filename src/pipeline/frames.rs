use crate::error::{Result, UsmError};

/// One frame of the source elementary stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub index: usize,
    /// Byte offset of the frame in the source file
    pub offset: u64,
    pub size: usize,
    pub keyframe: bool,
}

/// Frame sizes from packet offsets: each frame runs to the next packet,
/// the last one to the end of the file.
///
/// Every size must be positive and fit in 32 bits.
pub fn build_frame_sizes(offsets: &[u64], total_size: u64) -> Result<Vec<usize>> {
    let mut sizes = Vec::with_capacity(offsets.len());
    for (i, &start) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(total_size);
        let size = end as i64 - start as i64;
        if size <= 0 || size > i32::MAX as i64 {
            return Err(UsmError::CorruptFrameTable { frame: i, size });
        }
        sizes.push(size as usize);
    }
    Ok(sizes)
}

/// Build the frame table for a source of `total_size` bytes.
///
/// Bytes ahead of the first packet (a container file header such as IVF's)
/// are carried by frame 0, so the frames cover the whole source.
pub fn build_frame_table(
    offsets: &[u64],
    keyframes: &[bool],
    total_size: u64,
) -> Result<Vec<FrameDescriptor>> {
    let sizes = build_frame_sizes(offsets, total_size)?;
    let mut frames: Vec<FrameDescriptor> = offsets
        .iter()
        .zip(sizes)
        .enumerate()
        .map(|(index, (&offset, size))| FrameDescriptor {
            index,
            offset,
            size,
            keyframe: keyframes.get(index).copied().unwrap_or(false),
        })
        .collect();

    if let Some(first) = frames.first_mut() {
        let lead_in = first.offset as usize;
        let size = first.size + lead_in;
        if size > i32::MAX as usize {
            return Err(UsmError::CorruptFrameTable {
                frame: 0,
                size: size as i64,
            });
        }
        first.offset = 0;
        first.size = size;
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_from_offsets() {
        let sizes = build_frame_sizes(&[32, 132, 4228], 4278).unwrap();
        assert_eq!(sizes, vec![100, 4096, 50]);
        assert_eq!(sizes.iter().sum::<usize>() as u64, 4278 - 32);
    }

    #[test]
    fn test_single_frame_runs_to_eof() {
        assert_eq!(build_frame_sizes(&[10], 25).unwrap(), vec![15]);
    }

    #[test]
    fn test_non_increasing_offsets_rejected() {
        let err = build_frame_sizes(&[0, 50, 50, 80], 100).unwrap_err();
        assert!(matches!(err, UsmError::CorruptFrameTable { frame: 1, size: 0 }));

        let err = build_frame_sizes(&[0, 60, 40], 100).unwrap_err();
        assert!(matches!(err, UsmError::CorruptFrameTable { frame: 1, .. }));
    }

    #[test]
    fn test_offset_past_eof_rejected() {
        let err = build_frame_sizes(&[0, 200], 100).unwrap_err();
        assert!(matches!(err, UsmError::CorruptFrameTable { frame: 1, size: -100 }));
    }

    #[test]
    fn test_frame_table_absorbs_lead_in() {
        let frames = build_frame_table(&[32, 132, 4228], &[true, false, true], 4278).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].offset, 0);
        assert_eq!(frames[0].size, 132);
        assert_eq!(frames[1].offset, 132);
        assert_eq!(frames[1].size, 4096);
        assert!(frames[2].keyframe);
        assert!(!frames[1].keyframe);
        assert_eq!(frames.iter().map(|f| f.size).sum::<usize>(), 4278);
    }

    #[test]
    fn test_sizes_sum_to_span() {
        // Monotonic offsets always cover total - first offset exactly
        let offsets: Vec<u64> = (0..50).map(|i| 7 + i * i + i).collect();
        let total = offsets.last().unwrap() + 99;
        let sizes = build_frame_sizes(&offsets, total).unwrap();
        assert_eq!(sizes.len(), offsets.len());
        assert!(sizes.iter().all(|&s| s > 0));
        assert_eq!(sizes.iter().sum::<usize>() as u64, total - offsets[0]);
    }
}
