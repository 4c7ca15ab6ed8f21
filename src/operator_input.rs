use log::{info, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::mpsc::error::TryRecvError;

/// Source of single-character operator commands.
pub trait OperatorInput {
    /// Returns the next pending command character, if any. Never blocks.
    fn poll_command(&mut self) -> Option<char>;
}

/// Receives command characters sent from another task. Once every sender is
/// gone, a single 'q' is reported so the capture loop winds down.
pub struct ChannelInput {
    receiver: UnboundedReceiver<char>,
    disconnected: bool,
}

impl ChannelInput {
    pub fn new(receiver: UnboundedReceiver<char>) -> Self {
        ChannelInput{receiver, disconnected: false}
    }
}

impl OperatorInput for ChannelInput {
    fn poll_command(&mut self) -> Option<char> {
        if self.disconnected {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(c) => Some(c),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                info!("Operator input closed");
                self.disconnected = true;
                Some('q')
            },
        }
    }
}

/// Reads lines from `reader` and forwards each non-whitespace character to
/// `sender`. Returns at end of input or when the receiving side is dropped.
pub async fn forward_commands<R>(reader: R, sender: UnboundedSender<char>)
where R: AsyncBufRead + Unpin
{
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!("Error reading operator input: {:?}", e);
                return;
            },
        };
        for c in line.chars().filter(|c| !c.is_whitespace()) {
            if sender.send(c).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use super::*;

    #[test]
    fn test_poll_never_blocks() {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut input = ChannelInput::new(receiver);
        assert_eq!(input.poll_command(), None);
        sender.send('a').unwrap();
        sender.send('h').unwrap();
        assert_eq!(input.poll_command(), Some('a'));
        assert_eq!(input.poll_command(), Some('h'));
        assert_eq!(input.poll_command(), None);
    }

    #[test]
    fn test_disconnect_reports_quit_once() {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut input = ChannelInput::new(receiver);
        sender.send('n').unwrap();
        drop(sender);
        assert_eq!(input.poll_command(), Some('n'));
        assert_eq!(input.poll_command(), Some('q'));
        assert_eq!(input.poll_command(), None);
    }

    #[tokio::test]
    async fn test_forward_commands() {
        let (sender, receiver) = mpsc::unbounded_channel();
        let text: &[u8] = b"a\n n m\n\nq x\n";
        forward_commands(text, sender).await;
        let mut input = ChannelInput::new(receiver);
        let mut received = Vec::new();
        while let Some(c) = input.poll_command() {
            received.push(c);
        }
        // The trailing 'q' is the disconnect notice.
        assert_eq!(received, vec!['a', 'n', 'm', 'q', 'x', 'q']);
    }
}
