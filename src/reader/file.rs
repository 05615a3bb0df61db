// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::{trace, warn};

use super::{ConnectError, FetchError, LogClient, LogConnection, StartPosition};
use crate::event::EventData;

/// One line of a partition file.
#[derive(Debug, Deserialize)]
struct FileRecord {
    body: String,
    #[serde(default)]
    properties: HashMap<String, String>,
    #[serde(default)]
    partition_key: Option<String>,
    #[serde(default)]
    enqueued_time: Option<DateTime<Utc>>,
}

/// A partitioned log kept as one JSON-lines file per partition,
/// `<dir>/<partition>.jsonl`. The offset of an event is its line number.
///
/// Files are tailed: lines appended by another process show up on later
/// fetches, and a line without its trailing newline yet is not read.
#[derive(Debug, Clone)]
pub struct FileLogClient {
    dir: PathBuf,
    poll_interval: Duration,
}

impl FileLogClient {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
        }
    }

    pub fn partition_path(&self, partition_id: i32) -> PathBuf {
        self.dir.join(format!("{}.jsonl", partition_id))
    }
}

async fn count_lines(path: &Path) -> io::Result<i64> {
    match tokio::fs::read(path).await {
        Ok(content) => Ok(content.iter().filter(|b| **b == b'\n').count() as i64),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

impl LogClient for FileLogClient {
    type Connection = FileConnection;

    async fn connect(
        &self,
        partition_id: i32,
        start: StartPosition,
    ) -> Result<Self::Connection, ConnectError> {
        if partition_id < 0 {
            return Err(ConnectError::UnknownPartition(partition_id));
        }
        let unreachable = |e: io::Error| ConnectError::Unreachable {
            partition_id,
            reason: format!("{}: {}", self.dir.display(), e),
        };
        if !tokio::fs::try_exists(&self.dir).await.map_err(unreachable)? {
            return Err(unreachable(io::Error::from(io::ErrorKind::NotFound)));
        }

        let path = self.partition_path(partition_id);
        let (skip_below, enqueued_after) = match start {
            StartPosition::Offset(offset) => (offset.max(0), None),
            StartPosition::Earliest => (0, None),
            StartPosition::Latest => (count_lines(&path).await.map_err(unreachable)?, None),
            StartPosition::EnqueuedAfter(time) => (0, Some(time)),
        };

        Ok(FileConnection {
            partition_id,
            path,
            poll_interval: self.poll_interval,
            reader: None,
            partial: Vec::new(),
            next_line: 0,
            skip_below,
            enqueued_after,
        })
    }
}

#[derive(Debug)]
pub struct FileConnection {
    partition_id: i32,
    path: PathBuf,
    poll_interval: Duration,
    reader: Option<BufReader<File>>,
    /// Bytes of a line whose newline has not been written yet.
    partial: Vec<u8>,
    next_line: i64,
    skip_below: i64,
    /// Cleared by the first event enqueued after the timestamp.
    enqueued_after: Option<DateTime<Utc>>,
}

impl FileConnection {
    fn transport_error(&self, e: io::Error) -> FetchError {
        FetchError::Transport {
            partition_id: self.partition_id,
            reason: format!("{}: {}", self.path.display(), e),
        }
    }

    /// Every complete line owns an offset, readable or not.
    fn decode(&mut self, line: &[u8], offset: i64) -> Option<EventData> {
        if offset < self.skip_below {
            return None;
        }
        let record: FileRecord = match serde_json::from_slice(line) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    partition = self.partition_id,
                    offset,
                    error = %e,
                    "skipping unreadable event"
                );
                return None;
            }
        };
        let enqueued_time = record.enqueued_time.unwrap_or_else(Utc::now);
        if let Some(after) = self.enqueued_after {
            if enqueued_time <= after {
                return None;
            }
            self.enqueued_after = None;
        }

        let mut event =
            EventData::new(record.body, offset, offset).with_enqueued_time(enqueued_time);
        event.properties = record.properties;
        event.system_properties.partition_key = record.partition_key;
        Some(event)
    }

    /// Reads the complete lines available now, up to `max_count` events.
    async fn read_available(&mut self, max_count: usize) -> io::Result<Vec<EventData>> {
        if self.reader.is_none() {
            match File::open(&self.path).await {
                Ok(file) => self.reader = Some(BufReader::new(file)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e),
            }
        }

        let mut events = Vec::new();
        while events.len() < max_count {
            let Some(reader) = self.reader.as_mut() else {
                break;
            };
            let read = match reader.read_until(b'\n', &mut self.partial).await {
                Ok(read) => read,
                Err(e) if !events.is_empty() => {
                    warn!(
                        partition = self.partition_id,
                        line = self.next_line,
                        error = %e,
                        "read interrupted, returning the events read so far"
                    );
                    break;
                }
                Err(e) => return Err(e),
            };
            if read == 0 || self.partial.last() != Some(&b'\n') {
                break;
            }
            let line = std::mem::take(&mut self.partial);
            let offset = self.next_line;
            self.next_line += 1;
            if let Some(event) = self.decode(&line, offset) {
                events.push(event);
            }
        }
        Ok(events)
    }
}

impl LogConnection for FileConnection {
    async fn fetch(
        &mut self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<EventData>, FetchError> {
        let deadline = Instant::now() + timeout;
        loop {
            let events = match self.read_available(max_count).await {
                Ok(events) => events,
                Err(e) => return Err(self.transport_error(e)),
            };
            if !events.is_empty() {
                return Ok(events);
            }
            let now = Instant::now();
            if now >= deadline {
                trace!(
                    partition = self.partition_id,
                    line = self.next_line,
                    "end of partition file"
                );
                return Ok(events);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn close(&mut self) {
        self.reader = None;
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_lines(dir: &TempDir, partition_id: i32, lines: &[&str]) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.path().join(format!("{}.jsonl", partition_id)))
            .unwrap();
        for line in lines {
            file.write_all(line.as_bytes()).unwrap();
        }
    }

    fn write_bytes(dir: &TempDir, partition_id: i32, bytes: &[u8]) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.path().join(format!("{}.jsonl", partition_id)))
            .unwrap();
        file.write_all(bytes).unwrap();
    }

    fn client(dir: &TempDir) -> FileLogClient {
        FileLogClient::new(dir.path(), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn offsets_are_line_numbers_and_corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        write_lines(
            &dir,
            0,
            &[
                "{\"body\":\"a\",\"properties\":{\"k\":\"v\"}}\n",
                "not json\n",
                "{\"body\":\"c\",\"partition_key\":\"pk\"}\n",
            ],
        );

        let mut connection = client(&dir).connect(0, StartPosition::Earliest).await.unwrap();
        let events = connection.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(events.iter().map(EventData::offset).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(events[0].properties["k"], "v");
        assert_eq!(events[1].system_properties.partition_key.as_deref(), Some("pk"));
    }

    #[tokio::test]
    async fn invalid_utf8_line_keeps_its_offset() {
        let dir = TempDir::new().unwrap();
        write_bytes(&dir, 0, b"{\"body\":\"a\"}\n\xff\xfe\n{\"body\":\"c\"}\n");
        let client = client(&dir);

        let mut earliest = client.connect(0, StartPosition::Earliest).await.unwrap();
        let events = earliest.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(events.iter().map(EventData::offset).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(events[0].body, bytes::Bytes::from("a"));

        let mut latest = client.connect(0, StartPosition::Latest).await.unwrap();
        assert!(latest.fetch(10, Duration::from_millis(10)).await.unwrap().is_empty());
        write_lines(&dir, 0, &["{\"body\":\"d\"}\n"]);
        let events = latest.fetch(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(events.iter().map(EventData::offset).collect::<Vec<_>>(), vec![3]);
        assert_eq!(events[0].body, bytes::Bytes::from("d"));
    }

    #[tokio::test]
    async fn partial_line_waits_for_its_newline() {
        let dir = TempDir::new().unwrap();
        write_lines(&dir, 1, &["{\"body\":\"a\"}\n", "{\"body\":"]);

        let mut connection = client(&dir).connect(1, StartPosition::Earliest).await.unwrap();
        assert_eq!(connection.fetch(10, Duration::from_millis(10)).await.unwrap().len(), 1);
        assert!(connection.fetch(10, Duration::from_millis(10)).await.unwrap().is_empty());

        write_lines(&dir, 1, &["\"b\"}\n"]);
        let events = connection.fetch(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].offset(), 1);
        assert_eq!(events[0].body, bytes::Bytes::from("b"));
    }

    #[tokio::test]
    async fn start_positions_are_honored() {
        let dir = TempDir::new().unwrap();
        write_lines(
            &dir,
            0,
            &[
                "{\"body\":\"a\",\"enqueued_time\":\"2024-01-01T00:00:00Z\"}\n",
                "{\"body\":\"b\",\"enqueued_time\":\"2024-06-01T00:00:00Z\"}\n",
                "{\"body\":\"c\",\"enqueued_time\":\"2024-09-01T00:00:00Z\"}\n",
            ],
        );
        let client = client(&dir);

        let mut from_offset = client.connect(0, StartPosition::Offset(2)).await.unwrap();
        let events = from_offset.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(events.iter().map(EventData::offset).collect::<Vec<_>>(), vec![2]);

        let mut latest = client.connect(0, StartPosition::Latest).await.unwrap();
        assert!(latest.fetch(10, Duration::from_millis(10)).await.unwrap().is_empty());

        let after = "2024-03-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let mut enqueued = client
            .connect(0, StartPosition::EnqueuedAfter(after))
            .await
            .unwrap();
        let events = enqueued.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(events.iter().map(EventData::offset).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn missing_directory_is_unreachable() {
        let dir = TempDir::new().unwrap();
        let client = FileLogClient::new(dir.path().join("absent"), Duration::from_millis(5));
        assert!(matches!(
            client.connect(0, StartPosition::Earliest).await,
            Err(ConnectError::Unreachable { .. })
        ));
    }
}
