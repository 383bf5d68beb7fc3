use rtrb::{Consumer, Producer, RingBuffer};

/// Lock-free sample ring bridging the cpal callback to the blocking
/// capture-source read. Split once into the two thread-owned halves.
pub struct SampleRing;

impl SampleRing {
    pub fn with_capacity(samples: usize) -> (RingWriter, RingReader) {
        let (producer, consumer) = RingBuffer::new(samples);
        (RingWriter { producer }, RingReader { consumer })
    }
}

pub struct RingWriter {
    producer: Producer<i16>,
}

impl RingWriter {
    /// Non-blocking write for the audio callback. Writes as much as fits
    /// and returns the number of samples that were lost (0 on success);
    /// the callback must never block or allocate.
    pub fn push(&mut self, samples: &[i16]) -> usize {
        let writable = self.producer.slots().min(samples.len());
        if writable == 0 {
            return samples.len();
        }
        // The producer is the only writer, so `slots()` cannot shrink
        // between the check and the claim.
        let mut chunk = match self.producer.write_chunk(writable) {
            Ok(chunk) => chunk,
            Err(_) => return samples.len(),
        };
        let (first, second) = chunk.as_mut_slices();
        let split = first.len();
        first.copy_from_slice(&samples[..split]);
        if !second.is_empty() {
            second.copy_from_slice(&samples[split..writable]);
        }
        chunk.commit_all();
        samples.len() - writable
    }
}

pub struct RingReader {
    consumer: Consumer<i16>,
}

impl RingReader {
    pub fn available(&self) -> usize {
        self.consumer.slots()
    }

    /// Reads exactly `out.len()` samples, or nothing. Returns false when
    /// fewer samples are buffered.
    pub fn read_exact(&mut self, out: &mut [i16]) -> bool {
        let chunk = match self.consumer.read_chunk(out.len()) {
            Ok(chunk) => chunk,
            Err(rtrb::chunks::ChunkError::TooFewSlots(_)) => return false,
        };
        let (first, second) = chunk.as_slices();
        let split = first.len();
        out[..split].copy_from_slice(first);
        if !second.is_empty() {
            out[split..].copy_from_slice(second);
        }
        chunk.commit_all();
        true
    }
}
