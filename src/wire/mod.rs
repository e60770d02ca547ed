use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{self, Framed};

pub mod decoder;
pub mod encoder;
mod parser;
pub mod protocol;

use decoder::{Decoder, Frame};
use protocol::Response;

/// Wraps a connection in this protocol's framing.
///
/// `max_body` is the largest put body the decoder will buffer; larger
/// bodies are drained off the wire and surface as
/// [Frame::OversizeBody].
pub fn framed<T: AsyncRead + AsyncWrite>(
    stream: T,
    max_body: usize,
) -> Framed<T, Codec> {
    Framed::new(
        stream,
        Codec {
            decoder: Decoder::new(max_body),
        },
    )
}

/// The connection codec. All state lives on the decode side; replies are
/// pure functions of the [Response] value, so this is just the glue that
/// satisfies [Framed]'s single-codec shape.
pub struct Codec {
    decoder: Decoder,
}

impl codec::Decoder for Codec {
    type Item = Frame;

    type Error = decoder::Error;

    fn decode(
        &mut self,
        src: &mut bytes::BytesMut,
    ) -> Result<Option<Frame>, decoder::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Response> for Codec {
    type Error = encoder::Error;

    fn encode(
        &mut self,
        item: Response,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), encoder::Error> {
        encoder::encode(item, dst)
    }
}
