//! Watch transfer frames
//! This module contains the frames written to the vendor transfer characteristic

use anyhow::Result;
use log::{debug, info};

use crate::core::bluetooth::constants::DATA_FRAME_HEADER_LEN;

/// Kind of payload announced by a BEGIN frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Image = 0x01,
    Package = 0x02,
}

/// Frames of one file transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFrame<'a> {
    /// Announces a payload (0x01)
    Begin {
        kind: TransferKind,
        index: u8,
        total_len: u32,
        /// Bytes of the first section; the rest is the thumbnail for images
        primary_len: u32,
        width: u16,
        height: u16,
        thumb_width: u16,
        thumb_height: u16,
    },
    /// A slice of the payload at `offset` (0x02)
    Data { offset: u32, payload: &'a [u8] },
    /// Closes the transfer with a CRC-32 of the whole payload (0x03)
    End { checksum: u32 },
}

impl TransferFrame<'_> {
    /// Convert the frame to its byte representation
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Begin {
                kind,
                index,
                total_len,
                primary_len,
                width,
                height,
                thumb_width,
                thumb_height,
            } => {
                let mut bytes = Vec::with_capacity(19);
                bytes.push(0x01);
                bytes.push(*kind as u8);
                bytes.push(*index);
                bytes.extend_from_slice(&total_len.to_le_bytes());
                bytes.extend_from_slice(&primary_len.to_le_bytes());
                bytes.extend_from_slice(&width.to_le_bytes());
                bytes.extend_from_slice(&height.to_le_bytes());
                bytes.extend_from_slice(&thumb_width.to_le_bytes());
                bytes.extend_from_slice(&thumb_height.to_le_bytes());
                bytes
            }
            Self::Data { offset, payload } => {
                let mut bytes = Vec::with_capacity(DATA_FRAME_HEADER_LEN + payload.len());
                bytes.push(0x02);
                bytes.extend_from_slice(&offset.to_le_bytes());
                bytes.extend_from_slice(payload);
                bytes
            }
            Self::End { checksum } => {
                let mut bytes = Vec::with_capacity(5);
                bytes.push(0x03);
                bytes.extend_from_slice(&checksum.to_le_bytes());
                bytes
            }
        }
    }
}

/// Frame writer trait
#[async_trait::async_trait]
pub trait FrameSender {
    /// Write one frame to the watch
    async fn send_frame(&self, frame: &[u8]) -> Result<()>;

    /// Longest frame one write may carry
    fn max_frame_len(&self) -> usize;
}

/// Drives one chunked transfer over a [`FrameSender`]
pub struct TransferExecutor<T: FrameSender> {
    frame_sender: T,
}

impl<T: FrameSender> TransferExecutor<T> {
    pub fn new(frame_sender: T) -> Self {
        Self { frame_sender }
    }

    /// Payload bytes per DATA frame
    pub fn chunk_size(&self) -> usize {
        self.frame_sender
            .max_frame_len()
            .saturating_sub(DATA_FRAME_HEADER_LEN)
            .max(1)
    }

    /// Writes BEGIN, the DATA chunks and END, reporting percent on every change.
    /// 100 is reported only after END was accepted.
    pub async fn send_payload<F>(&self, begin: TransferFrame<'_>, payload: &[u8], mut on_progress: F) -> Result<()>
    where
        F: FnMut(i32) + Send,
    {
        info!("Starting transfer of {} bytes", payload.len());
        self.frame_sender.send_frame(&begin.to_bytes()).await?;
        on_progress(0);

        let chunk_size = self.chunk_size();
        debug!("Sending {} byte chunks", chunk_size);
        let total = payload.len().max(1);
        let mut last_percent = 0;
        for (i, chunk) in payload.chunks(chunk_size).enumerate() {
            let offset = i * chunk_size;
            let frame = TransferFrame::Data {
                offset: offset as u32,
                payload: chunk,
            };
            self.frame_sender.send_frame(&frame.to_bytes()).await?;

            let percent = (((offset + chunk.len()) * 100 / total) as i32).min(99);
            if percent != last_percent {
                debug!("Transfer progress {}%", percent);
                on_progress(percent);
                last_percent = percent;
            }
        }

        let end = TransferFrame::End {
            checksum: crc32fast::hash(payload),
        };
        self.frame_sender.send_frame(&end.to_bytes()).await?;
        on_progress(100);
        info!("Transfer completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Payload bytes per chunk behind a 185 byte write limit
    const CHUNK: usize = 180;

    #[derive(Clone)]
    struct RecordingSender {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        fail_after: Option<usize>,
        max_frame_len: usize,
    }

    impl Default for RecordingSender {
        fn default() -> Self {
            Self {
                frames: Arc::default(),
                fail_after: None,
                max_frame_len: CHUNK + DATA_FRAME_HEADER_LEN,
            }
        }
    }

    #[async_trait::async_trait]
    impl FrameSender for RecordingSender {
        async fn send_frame(&self, frame: &[u8]) -> Result<()> {
            let mut frames = self.frames.lock().unwrap();
            if self.fail_after.is_some_and(|n| frames.len() >= n) {
                anyhow::bail!("write rejected");
            }
            frames.push(frame.to_vec());
            Ok(())
        }

        fn max_frame_len(&self) -> usize {
            self.max_frame_len
        }
    }

    fn begin(total_len: u32) -> TransferFrame<'static> {
        TransferFrame::Begin {
            kind: TransferKind::Package,
            index: 0,
            total_len,
            primary_len: total_len,
            width: 0,
            height: 0,
            thumb_width: 0,
            thumb_height: 0,
        }
    }

    #[test]
    fn begin_frame_layout() {
        let frame = TransferFrame::Begin {
            kind: TransferKind::Image,
            index: 2,
            total_len: 0x0102,
            primary_len: 0x0100,
            width: 240,
            height: 240,
            thumb_width: 80,
            thumb_height: 80,
        };
        assert_eq!(
            frame.to_bytes(),
            vec![0x01, 0x01, 0x02, 0x02, 0x01, 0, 0, 0x00, 0x01, 0, 0, 240, 0, 240, 0, 80, 0, 80, 0]
        );
    }

    #[test]
    fn data_frame_carries_offset() {
        let frame = TransferFrame::Data { offset: 360, payload: &[0xAA, 0xBB] };
        assert_eq!(frame.to_bytes(), vec![0x02, 0x68, 0x01, 0, 0, 0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn payload_is_chunked_and_progress_ends_at_100() {
        let sender = RecordingSender::default();
        let executor = TransferExecutor::new(sender.clone());
        let payload = vec![7u8; CHUNK * 2 + 10];
        let mut progress = Vec::new();

        executor
            .send_payload(begin(payload.len() as u32), &payload, |p| progress.push(p))
            .await
            .unwrap();

        let frames = sender.frames.lock().unwrap();
        // begin + 3 data + end
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[4][0], 0x03);
        assert_eq!(progress.first(), Some(&0));
        assert_eq!(progress.last(), Some(&100));
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn write_failure_stops_the_transfer() {
        let sender = RecordingSender {
            fail_after: Some(2),
            ..RecordingSender::default()
        };
        let executor = TransferExecutor::new(sender.clone());
        let payload = vec![1u8; CHUNK * 4];
        let mut progress = Vec::new();

        let result = executor
            .send_payload(begin(payload.len() as u32), &payload, |p| progress.push(p))
            .await;

        assert!(result.is_err());
        assert!(!progress.contains(&100));
    }

    #[tokio::test]
    async fn chunks_fit_the_write_limit() {
        // Default ATT MTU: 23 bytes minus the 3 byte write header
        let sender = RecordingSender {
            max_frame_len: 20,
            ..RecordingSender::default()
        };
        let executor = TransferExecutor::new(sender.clone());
        let payload: Vec<u8> = (0..40).collect();

        executor
            .send_payload(begin(payload.len() as u32), &payload, |_| {})
            .await
            .unwrap();

        let frames = sender.frames.lock().unwrap();
        let data: Vec<_> = frames.iter().filter(|f| f[0] == 0x02).collect();
        // 15 payload bytes per frame
        assert_eq!(data.len(), 3);
        assert!(data.iter().all(|f| f.len() <= 20));
        let offsets: Vec<u32> = data
            .iter()
            .map(|f| u32::from_le_bytes([f[1], f[2], f[3], f[4]]))
            .collect();
        assert_eq!(offsets, vec![0, 15, 30]);
        assert_eq!(data[2][5..], payload[30..]);
    }
}
