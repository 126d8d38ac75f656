//! Ogg Opus container writer.
//!
//! Pages are produced by the `ogg` crate; the OpusHead and OpusTags header
//! packets and granule positions are computed here.

use crate::config::RecordingConfig;
use ogg::writing::{PacketWriteEndInfo, PacketWriter};
use std::io::{self, Write};

const VENDOR: &str = concat!("parley ", env!("CARGO_PKG_VERSION"));

/// Writes opus packets as one Ogg logical bitstream.
///
/// The last packet written is held back until the next one arrives (or
/// [`OggOpusWriter::finish`] is called) so that it can carry the end-of-stream
/// flag.
pub struct OggOpusWriter<W: Write> {
    writer: PacketWriter<'static, W>,
    serial: u32,
    granule: u64,
    max_packets_per_page: usize,
    packets_in_page: usize,
    pending: Option<Vec<u8>>,
    tags_pending: bool,
    packets_written: u64,
}

impl<W: Write> OggOpusWriter<W> {
    /// Starts a bitstream with a random serial number and writes the OpusHead page.
    pub fn new(inner: W, config: &RecordingConfig) -> io::Result<Self> {
        Self::with_serial(inner, config, rand::random())
    }

    pub fn with_serial(inner: W, config: &RecordingConfig, serial: u32) -> io::Result<Self> {
        let mut writer = PacketWriter::new(inner);
        writer.write_packet(
            opus_head(config.channel_count, config.sample_rate),
            serial,
            PacketWriteEndInfo::EndPage,
            0,
        )?;
        Ok(Self {
            writer,
            serial,
            granule: 0,
            max_packets_per_page: config.max_packets_per_page.max(1),
            packets_in_page: 0,
            pending: None,
            tags_pending: true,
            packets_written: 0,
        })
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// The underlying writer. Pages already completed have been written to it.
    pub fn get_mut(&mut self) -> &mut W {
        self.writer.inner_mut()
    }

    /// Audio packets accepted so far, including the held-back one.
    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }

    /// Appends one opus packet. Empty packets are skipped.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` for packets whose TOC cannot be parsed; other
    /// errors come from the underlying writer.
    pub fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        if packet.is_empty() {
            return Ok(());
        }
        packet_samples(packet)?;
        self.write_tags(PacketWriteEndInfo::EndPage)?;
        self.packets_written += 1;
        if let Some(previous) = self.pending.replace(packet.to_vec()) {
            self.emit(previous, false)?;
        }
        Ok(())
    }

    /// Closes the bitstream and flushes the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        match self.pending.take() {
            Some(last) => {
                self.write_tags(PacketWriteEndInfo::EndPage)?;
                self.emit(last, true)?;
            }
            None => self.write_tags(PacketWriteEndInfo::EndStream)?,
        }
        let mut inner = self.writer.into_inner();
        inner.flush()?;
        Ok(inner)
    }

    fn write_tags(&mut self, end: PacketWriteEndInfo) -> io::Result<()> {
        if !self.tags_pending {
            return Ok(());
        }
        self.tags_pending = false;
        self.writer.write_packet(opus_tags(), self.serial, end, 0)
    }

    fn emit(&mut self, packet: Vec<u8>, last: bool) -> io::Result<()> {
        self.granule += packet_samples(&packet)?;
        self.packets_in_page += 1;
        let end = if last {
            PacketWriteEndInfo::EndStream
        } else if self.packets_in_page >= self.max_packets_per_page {
            PacketWriteEndInfo::EndPage
        } else {
            PacketWriteEndInfo::NormalPacket
        };
        if !matches!(end, PacketWriteEndInfo::NormalPacket) {
            self.packets_in_page = 0;
        }
        self.writer
            .write_packet(packet, self.serial, end, self.granule)
    }
}

fn opus_head(channel_count: u8, sample_rate: u32) -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(b"OpusHead");
    head.push(1);
    head.push(channel_count);
    head.extend_from_slice(&0u16.to_le_bytes()); // pre-skip
    head.extend_from_slice(&sample_rate.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes()); // output gain
    head.push(0); // mapping family
    head
}

fn opus_tags() -> Vec<u8> {
    let mut tags = Vec::with_capacity(16 + VENDOR.len());
    tags.extend_from_slice(b"OpusTags");
    tags.extend_from_slice(&(VENDOR.len() as u32).to_le_bytes());
    tags.extend_from_slice(VENDOR.as_bytes());
    tags.extend_from_slice(&0u32.to_le_bytes());
    tags
}

/// Samples per channel at 48 kHz encoded in `packet`, read from its TOC byte.
fn packet_samples(packet: &[u8]) -> io::Result<u64> {
    let toc = *packet
        .first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty opus packet"))?;
    let config = toc >> 3;
    let per_frame: u64 = match config {
        0..=11 => [480, 960, 1920, 2880][usize::from(config % 4)],
        12..=15 => [480, 960][usize::from(config % 2)],
        _ => [120, 240, 480, 960][usize::from(config % 4)],
    };
    let frames: u64 = match toc & 0x03 {
        0 => 1,
        1 | 2 => 2,
        _ => {
            let count = packet.get(1).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "opus packet with arbitrary frame count is truncated",
                )
            })?;
            u64::from(count & 0x3f)
        }
    };
    Ok(per_frame * frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// CELT fullband 20 ms, one frame.
    const PACKET: [u8; 3] = [0xf8, 0xff, 0xfe];

    fn read_all(bytes: Vec<u8>) -> Vec<ogg::Packet> {
        let mut reader = ogg::PacketReader::new(Cursor::new(bytes));
        let mut packets = Vec::new();
        while let Some(packet) = reader.read_packet().unwrap() {
            packets.push(packet);
        }
        packets
    }

    #[test]
    fn toc_byte_determines_sample_count() {
        assert_eq!(packet_samples(&[0xf8]).unwrap(), 960);
        assert_eq!(packet_samples(&[0xf9]).unwrap(), 1920);
        assert_eq!(packet_samples(&[0x08]).unwrap(), 960);
        assert_eq!(packet_samples(&[0xfb, 0x03]).unwrap(), 2880);
        assert!(packet_samples(&[0xfb]).is_err());
    }

    #[test]
    fn stream_starts_with_headers_and_ends_with_eos() {
        let config = RecordingConfig::default();
        let mut writer = OggOpusWriter::with_serial(Vec::new(), &config, 42).unwrap();
        for _ in 0..25 {
            writer.write_packet(&PACKET).unwrap();
        }
        let bytes = writer.finish().unwrap();

        assert_eq!(&bytes[..4], b"OggS");
        let packets = read_all(bytes);
        assert_eq!(packets.len(), 27);
        assert_eq!(&packets[0].data[..8], b"OpusHead");
        assert_eq!(packets[0].data.len(), 19);
        assert_eq!(packets[0].data[9], 2);
        assert_eq!(&packets[1].data[..8], b"OpusTags");

        let last = packets.last().unwrap();
        assert!(last.last_in_stream());
        assert_eq!(last.absgp_page(), 25 * 960);
        assert!(packets.iter().all(|p| p.stream_serial() == 42));
    }

    #[test]
    fn pages_hold_at_most_configured_packets() {
        let config = RecordingConfig::default();
        let mut writer = OggOpusWriter::with_serial(Vec::new(), &config, 7).unwrap();
        for _ in 0..21 {
            writer.write_packet(&PACKET).unwrap();
        }
        let packets = read_all(writer.finish().unwrap());
        let page_ends = packets
            .iter()
            .skip(2)
            .filter(|p| p.last_in_page())
            .count();
        // 10 + 10 + 1
        assert_eq!(page_ends, 3);
    }

    #[test]
    fn empty_recording_is_still_a_valid_stream() {
        let config = RecordingConfig::default();
        let writer = OggOpusWriter::with_serial(Vec::new(), &config, 1).unwrap();
        let packets = read_all(writer.finish().unwrap());
        assert_eq!(packets.len(), 2);
        assert!(packets[1].last_in_stream());
    }
}
