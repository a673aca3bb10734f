//! Multiplexed directory client.
//!
//! A [`Connection`] lets many threads keep requests in flight on one socket.
//! Every request is stamped with a fresh [`MessageId`](crate::protocol::MessageId)
//! and registered in the connection's correlation table before it is
//! written. A single dispatcher thread reads responses, looks up the owner
//! of each id and hands the response over:
//!
//! - synchronous callers ([`Connection::call`]) block on a one-shot reply
//!   slot until the response, their timeout, or a connection failure;
//! - searches ([`Connection::search`]) accumulate entries and references
//!   until the done marker, releasing the caller in batches;
//! - asynchronous listeners ([`Connection::register_async`],
//!   [`Connection::on_notification`]) are invoked on the dispatcher thread.
//!
//! # Failures
//!
//! Errors local to one exchange (a timeout, an undecodable payload, an
//! abandon) only reach that exchange. Errors that make the stream unusable
//! (I/O failure, an unreadable frame, a notice of disconnection) fail every
//! outstanding exchange at once and close the connection; see
//! [`ClientError::is_connection_error`].
mod connection;
mod dispatcher;
mod error;
mod results;
mod search;
mod subscription;
mod table;

pub use connection::Connection;
pub use error::ClientError;
pub use results::{Entries, SearchResults};
pub use search::{Search, SearchBatch};
pub use subscription::Subscription;
pub use table::{Listener, SearchPhase};

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted server on a loopback socket.
    use std::{
        io::Write,
        net::{Shutdown, TcpListener, TcpStream},
        time::Duration,
    };

    use crate::{
        config::ConnectionConfig,
        protocol::{Control, Frame, Message, MessageId, ProtocolTransport, Request, Response},
    };

    use super::Connection;

    pub(crate) struct Peer {
        reader: ProtocolTransport<TcpStream>,
        writer: ProtocolTransport<TcpStream>,
    }

    impl Peer {
        /// Reads the next request the client wrote.
        pub fn receive(&mut self) -> Message<Request> {
            let frame = self.reader.read_frame().expect("client frame");
            Message::<Request>::from_frame(frame).expect("client request")
        }

        pub fn reply(&mut self, id: MessageId, response: Response) {
            self.reply_with(id, response, Vec::new());
        }

        pub fn reply_with(&mut self, id: MessageId, response: Response, controls: Vec<Control>) {
            self.writer
                .write_message(&Message::new(id, response, controls))
                .expect("write response");
        }

        pub fn send_frame(&mut self, frame: Frame) {
            self.writer.write_frame(&frame).expect("write frame");
        }

        pub fn send_raw(&mut self, bytes: &[u8]) {
            let mut stream = self.writer.get_ref();
            stream.write_all(bytes).expect("write bytes");
            stream.flush().expect("flush");
        }

        pub fn hang_up(&mut self) {
            let _ = self.writer.get_ref().shutdown(Shutdown::Both);
        }
    }

    pub(crate) fn connect() -> (Connection, Peer) {
        let _ = env_logger::builder().is_test(true).try_init();

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let address = listener.local_addr().expect("local address");
        let connection =
            Connection::connect(address, &ConnectionConfig::default()).expect("connect");
        let (stream, _) = listener.accept().expect("accept");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("read timeout");
        let writer = stream.try_clone().expect("clone stream");

        let peer = Peer {
            reader: ProtocolTransport::new(stream),
            writer: ProtocolTransport::new(writer),
        };
        (connection, peer)
    }
}
