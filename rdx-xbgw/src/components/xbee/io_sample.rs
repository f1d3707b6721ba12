//! Parsing of XBee I/O sample (`IS`) payloads.
//!
//! Series 1 radios produce an odd-length payload with a combined 16-bit
//! channel mask (low 9 bits digital, high 7 bits analog). Series 2 radios
//! produce an even-length payload with a 16-bit digital mask followed by an
//! 8-bit analog mask. In both, a 16-bit word of digital states follows when
//! any digital channel is enabled, then one 16-bit word per analog channel.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("I/O sample truncated: needed {needed} bytes, got {available}")]
pub struct SampleError {
    pub needed: usize,
    pub available: usize,
}

/// One parsed I/O sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoSample {
    /// `(DIO index, state)` in ascending channel order.
    pub digital: Vec<(u8, bool)>,
    /// `(AD index, raw reading)` in ascending channel order.
    pub analog: Vec<(u8, u16)>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SampleError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(SampleError {
                needed: end,
                available: self.data.len(),
            });
        }
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, SampleError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SampleError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

impl IoSample {
    /// Parses the response to an `IS` command or an I/O sample frame.
    pub fn parse(data: &[u8]) -> Result<IoSample, SampleError> {
        let mut cursor = Cursor { data, pos: 0 };
        let (mut digital_mask, mut analog_mask) = if data.len() % 2 == 0 {
            let _count = cursor.u8()?;
            let digital = cursor.u16()?;
            let analog = cursor.u8()?;
            (digital, u16::from(analog))
        } else {
            let _count = cursor.u8()?;
            let mask = cursor.u16()?;
            (mask % 512, mask >> 9)
        };

        let mut sample = IoSample::default();
        if digital_mask != 0 {
            let mut states = cursor.u16()?;
            let mut channel = 0u8;
            while digital_mask != 0 {
                if digital_mask & 1 == 1 {
                    sample.digital.push((channel, states & 1 == 1));
                }
                digital_mask >>= 1;
                states >>= 1;
                channel += 1;
            }
        }

        let mut channel = 0u8;
        while analog_mask != 0 {
            if analog_mask & 1 == 1 {
                sample.analog.push((channel, cursor.u16()?));
            }
            analog_mask >>= 1;
            channel += 1;
        }
        Ok(sample)
    }

    /// Encodes the sample in the series 2 layout, as a radio would send it.
    ///
    /// Digital channels above 15 and analog channels above 7 cannot be
    /// represented and are skipped.
    pub fn encode(&self) -> Vec<u8> {
        let mut digital_mask = 0u16;
        let mut states = 0u16;
        for &(channel, state) in self.digital.iter().filter(|(c, _)| *c < 16) {
            digital_mask |= 1 << channel;
            if state {
                states |= 1 << channel;
            }
        }
        let mut analog: Vec<(u8, u16)> = self.analog.iter().copied().filter(|(c, _)| *c < 8).collect();
        analog.sort_by_key(|(channel, _)| *channel);
        let analog_mask = analog.iter().fold(0u8, |mask, (c, _)| mask | (1 << c));

        let mut out = vec![1u8];
        out.extend_from_slice(&digital_mask.to_be_bytes());
        out.push(analog_mask);
        if digital_mask != 0 {
            out.extend_from_slice(&states.to_be_bytes());
        }
        for (_, reading) in analog {
            out.extend_from_slice(&reading.to_be_bytes());
        }
        out
    }
}
