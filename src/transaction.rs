//! One SMTP mail transaction: the envelope (domain, reverse-path,
//! recipients) plus the asynchronous streaming write of the message
//! body into `tmp/`, and its atomic publish/clone into every
//! recipient's Maildir on commit.
//!
//! The write pipeline mirrors the POSIX AIO contract the original
//! server used: `add_data` submits one write and returns immediately;
//! `add_data_status` is polled non-blockingly on later ticks to learn
//! when it lands. Here the "AIO" is a `tokio::spawn`ed write against a
//! `tokio::fs::File`, reported back over a `oneshot` channel — same
//! submit-once/poll-later shape, realized with an async runtime
//! instead of a kernel AIO queue.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

use crate::error::StorageError;
use crate::maildir::Maildir;
use crate::settings::Settings;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum WriteStatus {
    NotStarted,
    Wait,
    Done,
    Error,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TransactionStatus {
    Wait,
    Done,
    Error,
}

enum WriteState {
    NotStarted,
    InFlight {
        rx: oneshot::Receiver<(File, std::io::Result<()>)>,
        next_offset: u64,
    },
    Idle {
        file: File,
        offset: u64,
    },
    Error,
}

pub struct Transaction {
    settings: Arc<Settings>,
    peer_ip: Ipv4Addr,
    local_ip: Ipv4Addr,
    domain: Option<String>,
    reverse_path: Option<String>,
    recipients: Vec<String>,
    first_recipient_maildir: Option<Maildir>,
    data_filename: Option<String>,
    is_active: bool,
    write: WriteState,
}

fn to_ipv4(addr: SocketAddr) -> Ipv4Addr {
    match addr.ip() {
        IpAddr::V4(v4) => v4,
        // Non-goal: IPv6 peer/local addresses are not logged; the
        // Received header falls back to the unspecified address.
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    }
}

impl Transaction {
    pub fn new(settings: Arc<Settings>, peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Transaction {
            settings,
            peer_ip: to_ipv4(peer_addr),
            local_ip: to_ipv4(local_addr),
            domain: None,
            reverse_path: None,
            recipients: Vec::new(),
            first_recipient_maildir: None,
            data_filename: None,
            is_active: false,
            write: WriteState::NotStarted,
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn reverse_path(&self) -> Option<&str> {
        self.reverse_path.as_deref()
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn set_domain(&mut self, value: String) {
        self.domain = Some(value);
    }

    /// Begin a new transaction. Preconditions: not already active. The
    /// EHLO/HELO domain is session-scoped and survives across
    /// transactions, unlike the envelope.
    pub fn begin(&mut self) {
        debug_assert!(!self.is_active);
        self.reverse_path = None;
        self.recipients.clear();
        self.first_recipient_maildir = None;
        self.data_filename = None;
        self.write = WriteState::NotStarted;
        self.is_active = true;
    }

    pub fn set_reverse_path(&mut self, value: String) {
        self.reverse_path = Some(value);
    }

    pub fn add_forward_path(&mut self, value: String) {
        self.recipients.push(value);
    }

    /// Build and submit the `Return-path`/`Received` header as the
    /// first write of the message body.
    pub async fn add_header(&mut self) -> Result<WriteStatus, StorageError> {
        let from_domain = self.domain.clone().unwrap_or_default();
        let reverse_path = self.reverse_path.clone().unwrap_or_default();
        let first_recipient = self
            .recipients
            .first()
            .cloned()
            .unwrap_or_default();
        let local_hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        let date = Utc::now().to_rfc2822();

        let header = format!(
            "Return-path: <{}>\r\nReceived: from {}({}) by {}({}) via SMTP for <{}>; {}\r\n",
            reverse_path,
            from_domain,
            self.peer_ip,
            local_hostname,
            self.local_ip,
            first_recipient,
            date,
        );

        self.add_data(Bytes::from(header.into_bytes())).await
    }

    /// Submit one write of `bytes` to the transaction's data file,
    /// creating it first if this is the transaction's first write.
    /// Returns `Wait` once the write has been submitted, `NotStarted`
    /// with an error recorded if a previous write already failed, or
    /// leaves a prior `Wait` untouched if one is still in flight
    /// (callers must check [`Transaction::add_data_status`] first).
    pub async fn add_data(&mut self, bytes: Bytes) -> Result<WriteStatus, StorageError> {
        match &self.write {
            WriteState::InFlight { .. } => return Ok(WriteStatus::Wait),
            WriteState::Error => return Err(StorageError::NoWriteInFlight),
            WriteState::NotStarted => {
                let (file, maildir) = self.create_file().await?;
                self.first_recipient_maildir = Some(maildir);
                self.submit_write(file, 0, bytes);
            }
            WriteState::Idle { .. } => {
                let (file, offset) = match std::mem::replace(&mut self.write, WriteState::Error) {
                    WriteState::Idle { file, offset } => (file, offset),
                    _ => unreachable!(),
                };
                self.submit_write(file, offset, bytes);
            }
        }
        Ok(WriteStatus::Wait)
    }

    fn submit_write(&mut self, mut file: File, offset: u64, bytes: Bytes) {
        let next_offset = offset + bytes.len() as u64;
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = file.write_all(&bytes).await;
            let _ = tx.send((file, result));
        });
        self.write = WriteState::InFlight { rx, next_offset };
    }

    async fn create_file(&mut self) -> Result<(File, Maildir), StorageError> {
        let first = self
            .recipients
            .first()
            .cloned()
            .ok_or(StorageError::NoWriteInFlight)?;
        let maildir = Maildir::init(&self.settings.maildir_root, &first).await?;
        let filename = self
            .data_filename
            .get_or_insert_with(generate_filename)
            .clone();
        let file = maildir.create_file(&filename).await?;
        Ok((file, maildir))
    }

    /// Non-blocking poll of the current write's status.
    pub fn add_data_status(&mut self) -> WriteStatus {
        match &mut self.write {
            WriteState::NotStarted => WriteStatus::NotStarted,
            WriteState::Error => WriteStatus::Error,
            WriteState::Idle { .. } => WriteStatus::Done,
            WriteState::InFlight { rx, next_offset } => {
                let next_offset = *next_offset;
                match rx.try_recv() {
                    Ok((file, Ok(()))) => {
                        self.write = WriteState::Idle {
                            file,
                            offset: next_offset,
                        };
                        WriteStatus::Done
                    }
                    Ok((_file, Err(_))) => {
                        self.write = WriteState::Error;
                        WriteStatus::Error
                    }
                    Err(oneshot::error::TryRecvError::Empty) => WriteStatus::Wait,
                    Err(oneshot::error::TryRecvError::Closed) => {
                        self.write = WriteState::Error;
                        WriteStatus::Error
                    }
                }
            }
        }
    }

    fn filename(&mut self) -> &str {
        if self.data_filename.is_none() {
            self.data_filename = Some(generate_filename());
        }
        self.data_filename.as_deref().unwrap()
    }

    /// Close the data file, publish it into the first recipient's
    /// `new/`, and hard-link it into every other recipient's `new/`.
    /// If cloning fails partway through, the canonical file is already
    /// published; this surfaces as `Error` without rolling it back
    /// (§9: partial-delivery semantics are an operator concern).
    pub async fn commit(&mut self) -> TransactionStatus {
        match self.add_data_status() {
            WriteStatus::Wait => return TransactionStatus::Wait,
            WriteStatus::Done => {}
            WriteStatus::NotStarted | WriteStatus::Error => {
                self.abort_file().await;
                self.is_active = false;
                return TransactionStatus::Error;
            }
        }

        let file = match std::mem::replace(&mut self.write, WriteState::NotStarted) {
            WriteState::Idle { file, .. } => file,
            _ => {
                self.is_active = false;
                return TransactionStatus::Error;
            }
        };
        drop(file);

        let filename = self.filename().to_string();
        let first_maildir = match self.first_recipient_maildir.clone() {
            Some(m) => m,
            None => {
                self.is_active = false;
                return TransactionStatus::Error;
            }
        };

        if first_maildir.move_to_new(&filename).await.is_err() {
            self.is_active = false;
            return TransactionStatus::Error;
        }

        let mut status = TransactionStatus::Done;
        for recipient in self.recipients.iter().skip(1) {
            let peer_maildir = match Maildir::init(&self.settings.maildir_root, recipient).await {
                Ok(m) => m,
                Err(_) => {
                    status = TransactionStatus::Error;
                    continue;
                }
            };
            if peer_maildir.clone_file(&first_maildir, &filename).await.is_err() {
                status = TransactionStatus::Error;
            }
        }

        self.is_active = false;
        status
    }

    /// Cancel any in-flight write, unlink the temp file, and clear
    /// transaction state. The greeted domain is preserved.
    pub async fn rollback(&mut self) {
        self.abort_file().await;
        self.reverse_path = None;
        self.recipients.clear();
        self.first_recipient_maildir = None;
        self.data_filename = None;
        self.write = WriteState::NotStarted;
        self.is_active = false;
    }

    async fn abort_file(&mut self) {
        if let Some(filename) = self.data_filename.clone() {
            if let Some(maildir) = self.first_recipient_maildir.clone() {
                let _ = maildir.remove_file(&filename).await;
            }
        }
        self.write = WriteState::NotStarted;
    }
}

fn generate_filename() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!(
        "{:016x}_{:016x}_{:08x}_{:08x}_{}.eml",
        now.as_secs(),
        now.subsec_micros(),
        std::process::id(),
        rand::thread_rng().gen::<u32>(),
        hostname,
    )
}
