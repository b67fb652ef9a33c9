//! Per-connection state: the input buffer, outbound response queue,
//! FSM state, bound transaction, and the dispatcher that drives all of
//! it one buffered command at a time.
//!
//! [`Context::process_buffered`] is the nonblocking dispatcher: it
//! never awaits network I/O itself. A pending asynchronous write is
//! observed through [`crate::transaction::Transaction::add_data_status`],
//! polled again on the next tick — it is never blocked on.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::command;
use crate::fsm::{State, StepResult};
use crate::reply::Reply;
use crate::settings::Settings;
use crate::transaction::{Transaction, TransactionStatus, WriteStatus};

const CRLF: &[u8] = b"\r\n";
const DATA_END_LINE: &[u8] = b".\r\n";
const COMMAND_TOKEN_MAX: usize = 4;

/// What the dispatcher is waiting on while `is_wait_transition` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    DataStart,
    MoreData,
    Commit,
}

pub struct Context {
    pub state: State,
    in_buffer: crate::buffer::Buffer,
    out_queue: VecDeque<Vec<u8>>,
    is_wait_transition: bool,
    pending: Pending,
    pub transaction: Transaction,
    pub uuid: String,
    init_time: Instant,
    last_action_time: Instant,
}

impl Context {
    pub fn new(settings: Arc<Settings>, peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        let now = Instant::now();
        let in_buffer = crate::buffer::Buffer::with_capacity(settings.max_in_message_size);
        let transaction = Transaction::new(settings, peer_addr, local_addr);
        Context {
            state: State::Init,
            in_buffer,
            out_queue: VecDeque::new(),
            is_wait_transition: false,
            pending: Pending::None,
            transaction,
            uuid: Uuid::new_v4().simple().to_string(),
            init_time: now,
            last_action_time: now,
        }
    }

    /// Drive the `Begin` transition: greet the client and move to
    /// `WaitEhlo`.
    pub fn begin(&mut self) {
        self.enqueue(Reply::service_ready());
        self.state = State::WaitEhlo;
    }

    pub fn is_waiting(&self) -> bool {
        self.is_wait_transition
    }

    pub fn is_done(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn session_duration(&self) -> Duration {
        self.init_time.elapsed()
    }

    /// The writable tail of the input buffer, for a direct `read()`.
    pub fn read_target(&mut self) -> &mut [u8] {
        if self.in_buffer.space() == 0 {
            self.in_buffer.drop_read();
        }
        self.in_buffer.write_slice_mut()
    }

    pub fn commit_read(&mut self, n: usize) {
        self.in_buffer.commit_write(n);
    }

    /// Pop the next fully-buffered reply to send, if any.
    pub fn pop_outbound(&mut self) -> Option<Vec<u8>> {
        self.out_queue.pop_front()
    }

    pub fn has_outbound(&self) -> bool {
        !self.out_queue.is_empty()
    }

    fn enqueue(&mut self, reply: Reply) {
        self.out_queue.push_back(reply.to_bytes());
    }

    /// Timeout handling: called by the caller's own clock when it
    /// decides too long has passed since the last processed command.
    pub fn note_timeout(&mut self) {
        self.state = State::Invalid;
        self.is_wait_transition = false;
    }

    pub fn idle_for(&self) -> Duration {
        self.last_action_time.elapsed()
    }

    /// Resume a pending asynchronous operation. No-op if nothing is
    /// pending. Never blocks: a write still in flight leaves
    /// `is_wait_transition` set for the next call.
    pub async fn poll_pending(&mut self) {
        match self.pending {
            Pending::None => {}
            Pending::DataStart => match self.transaction.add_data_status() {
                WriteStatus::Wait => {}
                WriteStatus::Done => {
                    self.enqueue(Reply::start_mail_input());
                    self.clear_pending();
                }
                WriteStatus::Error | WriteStatus::NotStarted => {
                    self.transaction.rollback().await;
                    self.enqueue(Reply::internal_error());
                    self.state = State::Error;
                    self.clear_pending();
                }
            },
            Pending::MoreData => match self.transaction.add_data_status() {
                WriteStatus::Wait => {}
                WriteStatus::Done => {
                    self.clear_pending();
                }
                WriteStatus::Error | WriteStatus::NotStarted => {
                    self.transaction.rollback().await;
                    self.enqueue(Reply::internal_error());
                    self.state = State::Error;
                    self.clear_pending();
                }
            },
            Pending::Commit => match self.transaction.commit().await {
                TransactionStatus::Wait => {}
                TransactionStatus::Done => {
                    self.enqueue(Reply::ok());
                    self.clear_pending();
                }
                TransactionStatus::Error => {
                    self.enqueue(Reply::internal_error());
                    self.clear_pending();
                }
            },
        }
    }

    fn clear_pending(&mut self) {
        self.pending = Pending::None;
        self.is_wait_transition = false;
    }

    /// The nonblocking dispatcher: parse and act on at most one
    /// buffered command. Returns once there is nothing more it can do
    /// without new input or a completed async op.
    pub async fn process_buffered(&mut self) {
        if self.is_wait_transition || self.is_done() {
            return;
        }

        if self.in_buffer.find(CRLF).is_none() {
            return;
        }

        skip_leading_whitespace(&mut self.in_buffer);

        if self.state == State::WaitMoreData {
            self.process_wait_more_data().await;
        } else {
            self.process_command().await;
        }

        self.last_action_time = Instant::now();
    }

    async fn process_wait_more_data(&mut self) {
        let crlf_offset = match self.in_buffer.find(CRLF) {
            Some(p) => p,
            None => return,
        };
        let line_len = crlf_offset + CRLF.len();
        let is_data_end = &self.in_buffer.unread()[..line_len] == DATA_END_LINE;
        let line = self.in_buffer.unread()[..line_len].to_vec();
        self.in_buffer.advance_read(line_len);

        if is_data_end {
            self.state = State::WaitMail;
            match self.transaction.commit().await {
                TransactionStatus::Wait => {
                    self.pending = Pending::Commit;
                    self.is_wait_transition = true;
                }
                TransactionStatus::Done => {
                    self.enqueue(Reply::ok());
                }
                TransactionStatus::Error => {
                    self.enqueue(Reply::internal_error());
                }
            }
        } else {
            match self.transaction.add_data(bytes::Bytes::from(line)).await {
                Ok(WriteStatus::Wait) => {
                    self.pending = Pending::MoreData;
                    self.is_wait_transition = true;
                }
                Ok(_) | Err(_) => {
                    self.transaction.rollback().await;
                    self.enqueue(Reply::internal_error());
                    self.state = State::Error;
                }
            }
        }
    }

    async fn process_command(&mut self) {
        let token = extract_token(&self.in_buffer);
        let step = self.dispatch(&token).await;
        if step == StepResult::Error {
            self.enqueue(Reply::internal_error());
            self.state = State::Error;
        }
    }

    /// Table-driven classification + handling for every state except
    /// `WaitMoreData` (handled separately: its terminator depends on
    /// the full line, not the truncated token).
    async fn dispatch(&mut self, token: &str) -> StepResult {
        match token {
            "quit" => {
                self.consume_line();
                self.enqueue(Reply::closing());
                self.state = State::Done;
                return StepResult::Succeed;
            }
            "noop" => {
                self.consume_line();
                self.enqueue(Reply::ok());
                return StepResult::Succeed;
            }
            "vrfy" => {
                self.consume_line();
                self.enqueue(Reply::not_implemented());
                return StepResult::Succeed;
            }
            _ => {}
        }

        let (correct, wrong): (&[&str], &[&str]) = match self.state {
            State::WaitEhlo => (&["ehlo", "helo", "rset"], &["data", "mail", "rcpt", "."]),
            State::WaitMail => (&["ehlo", "helo", "mail", "rset"], &["data", "rcpt", "."]),
            State::WaitRcpt => (&["ehlo", "helo", "rcpt", "rset"], &["data", "mail", "."]),
            State::WaitRcptOrData => {
                (&["data", "ehlo", "helo", "rcpt", "rset"], &["mail", "."])
            }
            State::Error => (&["ehlo", "helo", "rset"], &["data", "mail", "rcpt", "."]),
            State::Init | State::WaitMoreData | State::Done | State::Invalid => (&[], &[]),
        };

        if correct.iter().any(|c| token.starts_with(c)) {
            self.run_correct(token).await
        } else if wrong.iter().any(|w| token.starts_with(w)) {
            self.consume_line();
            self.enqueue(Reply::bad_sequence());
            self.state = State::Error;
            StepResult::Failed
        } else {
            self.consume_line();
            self.enqueue(Reply::syntax_error());
            self.state = State::Error;
            StepResult::Failed
        }
    }

    async fn run_correct(&mut self, token: &str) -> StepResult {
        if token.starts_with("ehlo") || token.starts_with("helo") {
            return self.handle_ehlo();
        }
        if token.starts_with("rset") {
            return self.handle_rset().await;
        }
        if token.starts_with("mail") {
            return self.handle_mail();
        }
        if token.starts_with("rcpt") {
            return self.handle_rcpt();
        }
        if token.starts_with("data") {
            return self.handle_data().await;
        }
        unreachable!("token {:?} classified correct with no handler", token)
    }

    fn handle_ehlo(&mut self) -> StepResult {
        let line_end = match self.in_buffer.find(CRLF) {
            Some(p) => p + CRLF.len(),
            None => return StepResult::Failed,
        };
        let line = self.in_buffer.unread()[..line_end].to_vec();
        match command::parse_ehlo_helo(&line) {
            Some(m) => {
                self.in_buffer.advance_read(m.consumed);
                if let Some(domain) = m.domain {
                    self.transaction.set_domain(domain);
                }
                self.state = State::WaitMail;
                self.enqueue(Reply::ok());
                StepResult::Succeed
            }
            None => {
                self.consume_line();
                self.enqueue(Reply::syntax_error());
                self.state = State::Error;
                StepResult::Failed
            }
        }
    }

    async fn handle_rset(&mut self) -> StepResult {
        self.consume_line();
        if self.transaction.is_active() {
            self.transaction.rollback().await;
        }
        self.state = if self.state == State::WaitEhlo {
            State::WaitEhlo
        } else {
            State::WaitMail
        };
        self.enqueue(Reply::ok());
        StepResult::Succeed
    }

    fn handle_mail(&mut self) -> StepResult {
        let line_end = match self.in_buffer.find(CRLF) {
            Some(p) => p + CRLF.len(),
            None => return StepResult::Failed,
        };
        let line = self.in_buffer.unread()[..line_end].to_vec();
        match command::parse_mail(&line) {
            Some(m) => {
                self.in_buffer.advance_read(m.consumed);
                self.transaction.begin();
                self.transaction.set_reverse_path(m.address);
                self.state = State::WaitRcpt;
                self.enqueue(Reply::ok());
                StepResult::Succeed
            }
            None => {
                self.consume_line();
                self.enqueue(Reply::bad_reverse_path());
                self.state = State::Error;
                StepResult::Failed
            }
        }
    }

    fn handle_rcpt(&mut self) -> StepResult {
        let line_end = match self.in_buffer.find(CRLF) {
            Some(p) => p + CRLF.len(),
            None => return StepResult::Failed,
        };
        let line = self.in_buffer.unread()[..line_end].to_vec();
        match command::parse_rcpt(&line) {
            Some(m) => {
                self.in_buffer.advance_read(m.consumed);
                self.transaction.add_forward_path(m.address);
                self.state = State::WaitRcptOrData;
                self.enqueue(Reply::ok());
                StepResult::Succeed
            }
            None => {
                self.consume_line();
                self.enqueue(Reply::bad_forward_path());
                self.state = State::Error;
                StepResult::Failed
            }
        }
    }

    async fn handle_data(&mut self) -> StepResult {
        self.consume_line();
        self.state = State::WaitMoreData;
        match self.transaction.add_header().await {
            Ok(WriteStatus::Wait) => {
                self.pending = Pending::DataStart;
                self.is_wait_transition = true;
                StepResult::Succeed
            }
            Ok(_) | Err(_) => {
                self.transaction.rollback().await;
                self.enqueue(Reply::internal_error());
                self.state = State::Error;
                StepResult::Failed
            }
        }
    }

    fn consume_line(&mut self) {
        self.in_buffer.shift_read_after(CRLF);
    }
}

/// Skip leading whitespace/CRLF bytes ahead of the next command, in
/// place, without copying.
fn skip_leading_whitespace(buf: &mut crate::buffer::Buffer) {
    let skip = buf
        .unread()
        .iter()
        .take_while(|&&b| b == b' ' || b == b'\t' || b == b'\r' || b == b'\n')
        .count();
    buf.advance_read(skip);
}

/// Extract the lowercased command token: bytes up to the first space
/// or CRLF, whichever comes first, clamped to 4 visible characters.
fn extract_token(buf: &crate::buffer::Buffer) -> String {
    let unread = buf.unread();
    let crlf = buf.find(CRLF).map(|p| p + CRLF.len()).unwrap_or(unread.len());
    let space = unread.iter().position(|&b| b == b' ').map(|p| p + 1);
    let end = space.unwrap_or(crlf).min(crlf).min(COMMAND_TOKEN_MAX);
    String::from_utf8_lossy(&unread[..end]).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn settings(root: &std::path::Path) -> Arc<Settings> {
        Arc::new(Settings {
            address: None,
            port: 2525,
            workers_count: 1,
            backlog_size: 16,
            maildir_root: root.to_path_buf(),
            log_path: root.join("log"),
            max_in_message_size: 1 << 16,
            timeout_ms: 200,
            daemon: false,
        })
    }

    fn addr(b: [u8; 4], p: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::from(b)), p)
    }

    fn feed(ctx: &mut Context, data: &[u8]) {
        let target = ctx.read_target();
        target[..data.len()].copy_from_slice(data);
        let n = data.len();
        ctx.commit_read(n);
    }

    async fn drain_wait(ctx: &mut Context) {
        let mut spins = 0;
        while ctx.is_waiting() {
            ctx.poll_pending().await;
            spins += 1;
            if spins > 10_000 {
                panic!("pending operation never resolved");
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn happy_path_single_recipient() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = Context::new(settings(root.path()), addr([10, 0, 0, 1], 1), addr([10, 0, 0, 2], 25));
        ctx.begin();
        assert_eq!(ctx.pop_outbound().unwrap(), Reply::service_ready().to_bytes());

        feed(&mut ctx, b"EHLO example.net\r\n");
        ctx.process_buffered().await;
        assert_eq!(ctx.pop_outbound().unwrap(), Reply::ok().to_bytes());
        assert_eq!(ctx.state, State::WaitMail);

        feed(&mut ctx, b"MAIL FROM:<a@example.net>\r\n");
        ctx.process_buffered().await;
        assert_eq!(ctx.pop_outbound().unwrap(), Reply::ok().to_bytes());
        assert_eq!(ctx.state, State::WaitRcpt);

        feed(&mut ctx, b"RCPT TO:<b@example.org>\r\n");
        ctx.process_buffered().await;
        assert_eq!(ctx.pop_outbound().unwrap(), Reply::ok().to_bytes());
        assert_eq!(ctx.state, State::WaitRcptOrData);

        feed(&mut ctx, b"DATA\r\n");
        ctx.process_buffered().await;
        assert_eq!(ctx.state, State::WaitMoreData);
        drain_wait(&mut ctx).await;
        assert_eq!(ctx.pop_outbound().unwrap(), Reply::start_mail_input().to_bytes());

        feed(&mut ctx, b"Subject: hi\r\n");
        ctx.process_buffered().await;
        drain_wait(&mut ctx).await;
        feed(&mut ctx, b"\r\n");
        ctx.process_buffered().await;
        drain_wait(&mut ctx).await;
        feed(&mut ctx, b"Hello\r\n");
        ctx.process_buffered().await;
        drain_wait(&mut ctx).await;

        feed(&mut ctx, b".\r\n");
        ctx.process_buffered().await;
        assert_eq!(ctx.state, State::WaitMail);
        drain_wait(&mut ctx).await;
        assert_eq!(ctx.pop_outbound().unwrap(), Reply::ok().to_bytes());

        feed(&mut ctx, b"QUIT\r\n");
        ctx.process_buffered().await;
        assert_eq!(ctx.pop_outbound().unwrap(), Reply::closing().to_bytes());
        assert_eq!(ctx.state, State::Done);

        let new_dir = root.path().join("example.org").join("b").join("Maildir").join("new");
        let mut entries = std::fs::read_dir(&new_dir).unwrap();
        let entry = entries.next().unwrap().unwrap();
        let contents = std::fs::read_to_string(entry.path()).unwrap();
        assert!(contents.ends_with("Hello\r\n"));
    }

    #[tokio::test]
    async fn bad_sequence_then_recovers_with_rset() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = Context::new(settings(root.path()), addr([10, 0, 0, 1], 1), addr([10, 0, 0, 2], 25));
        ctx.begin();
        ctx.pop_outbound();

        feed(&mut ctx, b"EHLO x\r\n");
        ctx.process_buffered().await;
        ctx.pop_outbound();

        feed(&mut ctx, b"DATA\r\n");
        ctx.process_buffered().await;
        assert_eq!(ctx.pop_outbound().unwrap(), Reply::bad_sequence().to_bytes());
        assert_eq!(ctx.state, State::Error);

        feed(&mut ctx, b"RSET\r\n");
        ctx.process_buffered().await;
        assert_eq!(ctx.pop_outbound().unwrap(), Reply::ok().to_bytes());
        assert_eq!(ctx.state, State::WaitMail);
    }

    #[tokio::test]
    async fn parse_failure_recovers_on_next_mail() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = Context::new(settings(root.path()), addr([10, 0, 0, 1], 1), addr([10, 0, 0, 2], 25));
        ctx.begin();
        ctx.pop_outbound();
        feed(&mut ctx, b"EHLO x\r\n");
        ctx.process_buffered().await;
        ctx.pop_outbound();

        feed(&mut ctx, b"MAIL FROM:<>\r\n");
        ctx.process_buffered().await;
        assert_eq!(ctx.pop_outbound().unwrap(), Reply::bad_reverse_path().to_bytes());
        assert_eq!(ctx.state, State::Error);
        assert!(!ctx.transaction.is_active());

        feed(&mut ctx, b"EHLO x\r\n");
        ctx.process_buffered().await;
        assert_eq!(ctx.pop_outbound().unwrap(), Reply::ok().to_bytes());
        assert_eq!(ctx.state, State::WaitMail);

        feed(&mut ctx, b"MAIL FROM:<a@x>\r\n");
        ctx.process_buffered().await;
        assert_eq!(ctx.pop_outbound().unwrap(), Reply::ok().to_bytes());
    }

    #[tokio::test]
    async fn rollback_mid_data_leaves_no_new_file() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = Context::new(settings(root.path()), addr([10, 0, 0, 1], 1), addr([10, 0, 0, 2], 25));
        ctx.begin();
        ctx.pop_outbound();
        feed(&mut ctx, b"EHLO x\r\n");
        ctx.process_buffered().await;
        ctx.pop_outbound();
        feed(&mut ctx, b"MAIL FROM:<a@x>\r\n");
        ctx.process_buffered().await;
        ctx.pop_outbound();
        feed(&mut ctx, b"RCPT TO:<b@example.org>\r\n");
        ctx.process_buffered().await;
        ctx.pop_outbound();
        feed(&mut ctx, b"DATA\r\n");
        ctx.process_buffered().await;
        drain_wait(&mut ctx).await;
        ctx.pop_outbound();

        feed(&mut ctx, b"Partial line\r\n");
        ctx.process_buffered().await;
        drain_wait(&mut ctx).await;

        feed(&mut ctx, b"RSET\r\n");
        ctx.process_buffered().await;
        assert_eq!(ctx.pop_outbound().unwrap(), Reply::ok().to_bytes());

        let new_dir = root.path().join("example.org").join("b").join("Maildir").join("new");
        assert_eq!(std::fs::read_dir(&new_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn malformed_ehlo_domain_gets_syntax_error_and_enters_error_state() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = Context::new(settings(root.path()), addr([10, 0, 0, 1], 1), addr([10, 0, 0, 2], 25));
        ctx.begin();
        ctx.pop_outbound();

        feed(&mut ctx, b"EHLO foo/bar\r\n");
        ctx.process_buffered().await;
        assert_eq!(ctx.pop_outbound().unwrap(), Reply::syntax_error().to_bytes());
        assert_eq!(ctx.state, State::Error);
    }

    /// A storage failure during `DATA`'s header write must produce
    /// exactly one `451`, not one from `handle_data` and a second from
    /// `process_command`'s generic `StepResult::Error` handling.
    #[tokio::test]
    async fn data_storage_failure_replies_with_a_single_internal_error() {
        let root = tempfile::tempdir().unwrap();
        // A regular file in place of the maildir root makes every
        // `Maildir::init` underneath it fail to create its directories.
        std::fs::write(root.path().join("not_a_dir"), b"").unwrap();
        let mut ctx = Context::new(
            settings(&root.path().join("not_a_dir")),
            addr([10, 0, 0, 1], 1),
            addr([10, 0, 0, 2], 25),
        );
        ctx.begin();
        ctx.pop_outbound();
        feed(&mut ctx, b"EHLO x\r\n");
        ctx.process_buffered().await;
        ctx.pop_outbound();
        feed(&mut ctx, b"MAIL FROM:<a@x>\r\n");
        ctx.process_buffered().await;
        ctx.pop_outbound();
        feed(&mut ctx, b"RCPT TO:<b@example.org>\r\n");
        ctx.process_buffered().await;
        ctx.pop_outbound();

        feed(&mut ctx, b"DATA\r\n");
        ctx.process_buffered().await;
        drain_wait(&mut ctx).await;

        assert_eq!(ctx.pop_outbound().unwrap(), Reply::internal_error().to_bytes());
        assert!(ctx.pop_outbound().is_none());
        assert_eq!(ctx.state, State::Error);
    }

    #[test]
    fn extract_token_truncates_to_four_chars() {
        let mut buf = crate::buffer::Buffer::with_capacity(64);
        buf.append(b"HELLOWORLD morestuff\r\n");
        assert_eq!(extract_token(&buf), "hell");
    }

    #[test]
    fn extract_token_stops_at_space() {
        let mut buf = crate::buffer::Buffer::with_capacity(64);
        buf.append(b"ab cd\r\n");
        assert_eq!(extract_token(&buf), "ab");
    }
}
