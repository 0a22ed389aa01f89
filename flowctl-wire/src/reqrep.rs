use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Largest payload a single frame may carry.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(u32),
}

#[derive(Debug, Clone)]
pub struct Message {
    header: Header,
    /// The message payload.
    payload: Bytes,
}

impl Message {
    pub fn new(id: u32, payload: Bytes) -> Self {
        Self { header: Header { id, size: payload.len() as u32 }, payload }
    }

    pub fn id(&self) -> u32 {
        self.header.id
    }

    /// Returns the total size of the frame on the wire, header included.
    pub fn size(&self) -> usize {
        Header::len() + self.payload.len()
    }

    pub fn payload_size(&self) -> u32 {
        self.header.size
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    /// The message ID. Replies carry the ID of the request they answer.
    pub(crate) id: u32,
    /// The size of the payload.
    pub(crate) size: u32,
}

impl Header {
    /// Returns the length of the header in bytes.
    #[inline]
    pub const fn len() -> usize {
        8
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Header,
    Payload(Header),
}

#[derive(Debug, Default)]
pub struct Codec {
    /// The current state of the decoder.
    state: State,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for Codec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Header => {
                    if src.len() < Header::len() {
                        return Ok(None);
                    }

                    let header = Header { id: src.get_u32(), size: src.get_u32() };

                    if header.size > MAX_FRAME_SIZE {
                        return Err(Error::FrameTooLarge(header.size));
                    }

                    src.reserve(header.size as usize);
                    self.state = State::Payload(header);
                }
                State::Payload(header) => {
                    if src.len() < header.size as usize {
                        return Ok(None);
                    }

                    let payload = src.split_to(header.size as usize);
                    let message = Message { header, payload: payload.freeze() };

                    self.state = State::Header;
                    return Ok(Some(message));
                }
            }
        }
    }
}

impl Encoder<Message> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        if item.payload_size() > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(item.payload_size()));
        }

        dst.reserve(item.size());

        dst.put_u32(item.header.id);
        dst.put_u32(item.header.size);
        dst.put(item.payload);

        Ok(())
    }
}
