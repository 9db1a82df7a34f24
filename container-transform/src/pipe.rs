// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded producer/consumer pipe for payload streams.

use {
    crate::{ContainerTransform, TransformError},
    crossbeam::channel::{bounded, Receiver, Sender},
    log::{debug, warn},
    std::io::{Read, Write},
};

/// Number of chunks that may be in flight before the producer blocks.
const PIPE_DEPTH: usize = 16;

/// Largest chunk sent through the pipe.
const CHUNK_SIZE: usize = 64 * 1024;

type Message = std::io::Result<Vec<u8>>;

/// Writing half of a payload pipe.
///
/// Writes block while the pipe is full. Once the reading half is dropped,
/// writes fail with [std::io::ErrorKind::BrokenPipe].
pub struct PipeWriter {
    sender: Sender<Message>,
}

impl PipeWriter {
    /// Forward a producer failure to the reader.
    fn fail(&self, error: &TransformError) {
        // The reader may be gone already.
        let _ = self.sender.send(Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            error.to_string(),
        )));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let len = buf.len().min(CHUNK_SIZE);

        self.sender.send(Ok(buf[..len].to_vec())).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "payload consumer hung up",
            )
        })?;

        Ok(len)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Reading half of a payload pipe.
///
/// End of stream is reported once the producer finished successfully. A
/// producer failure surfaces as a read error.
pub struct PipeReader {
    receiver: Receiver<Message>,
    chunk: Vec<u8>,
    position: usize,
    finished: bool,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.position == self.chunk.len() {
            if self.finished {
                return Ok(0);
            }

            match self.receiver.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.position = 0;
                }
                Ok(Err(e)) => {
                    self.finished = true;
                    return Err(e);
                }
                // All senders dropped.
                Err(_) => {
                    self.finished = true;
                    return Ok(0);
                }
            }
        }

        let count = buf.len().min(self.chunk.len() - self.position);
        buf[..count].copy_from_slice(&self.chunk[self.position..self.position + count]);
        self.position += count;

        Ok(count)
    }
}

fn pipe() -> (PipeWriter, PipeReader) {
    let (sender, receiver) = bounded(PIPE_DEPTH);

    (
        PipeWriter { sender },
        PipeReader {
            receiver,
            chunk: vec![],
            position: 0,
            finished: false,
        },
    )
}

/// Stream the payload of a transform into a consumer.
///
/// The payload is produced on a separate thread and handed to `consume`
/// through a bounded pipe, so it is never materialized in full. If `consume`
/// returns before reading everything, the producer's next write fails and
/// the producer stops.
///
/// A consumer error takes precedence over a producer error. A producer
/// failing only because the consumer hung up is not an error.
pub fn extract<T, F, R, E>(transform: &mut T, consume: F) -> Result<R, E>
where
    T: ContainerTransform + Send + ?Sized,
    F: FnOnce(&mut PipeReader) -> Result<R, E>,
    E: From<TransformError>,
{
    let (mut writer, mut reader) = pipe();

    let (consumed, produced) = crossbeam::thread::scope(|scope| {
        let producer = scope.spawn(move |_| {
            let res = transform.write_payload(&mut writer);

            if let Err(e) = &res {
                writer.fail(e);
            }

            res
        });

        let consumed = consume(&mut reader);
        // Unblocks a producer waiting on a full pipe.
        drop(reader);

        (consumed, producer.join())
    })
    .map_err(|_| E::from(TransformError::ProducerPanic))?;

    let produced = produced.map_err(|_| E::from(TransformError::ProducerPanic))?;
    let consumed = consumed?;

    match produced {
        Ok(()) => {
            debug!("payload producer finished");
            Ok(consumed)
        }
        Err(TransformError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
            warn!("payload consumer finished before the payload was fully produced");
            Ok(consumed)
        }
        Err(e) => Err(e.into()),
    }
}
