/// 双工链路
///
/// 一个 `Link` 由读端和写端组成，两端分别属于两条独立的有界管道
/// （上行：入站 → 出站，下行：出站 → 入站）。管道中保存的是按写入顺序排列的
/// `Bytes` 分块；写端在缓冲字节数达到容量时挂起，读端在管道为空时挂起。
/// 关闭一个方向不会影响另一个方向（支持半关闭）。
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{DispatchError, Result};

/// 每个方向的默认缓冲容量
pub const DEFAULT_LINK_CAPACITY: usize = 512 * 1024;

/// 单次从 socket 读取的缓冲区大小
const PUMP_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug)]
struct PipeState {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    write_closed: bool,
    read_closed: bool,
}

#[derive(Debug)]
struct PipeShared {
    state: Mutex<PipeState>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
    cancel: CancellationToken,
}

/// 创建一条有界管道
///
/// `cancel` 被取消时，所有阻塞在该管道上的读写立即返回 `DispatchError::Cancelled`。
pub fn pipe(capacity: usize, cancel: CancellationToken) -> (LinkWriter, LinkReader) {
    let shared = Arc::new(PipeShared {
        state: Mutex::new(PipeState {
            chunks: VecDeque::new(),
            buffered: 0,
            write_closed: false,
            read_closed: false,
        }),
        capacity: capacity.max(1),
        readable: Notify::new(),
        writable: Notify::new(),
        cancel,
    });

    (
        LinkWriter {
            shared: shared.clone(),
        },
        LinkReader { shared },
    )
}

/// 管道写端
#[derive(Debug)]
pub struct LinkWriter {
    shared: Arc<PipeShared>,
}

impl LinkWriter {
    /// 写入一个分块；缓冲已满时挂起
    pub async fn write(&self, chunk: Bytes) -> Result<()> {
        self.write_multi(vec![chunk]).await
    }

    /// 写入多个不连续的分块，保持顺序
    ///
    /// 只要管道未满就整体接收，因此单次写入可能略微超过容量。
    pub async fn write_multi(&self, chunks: Vec<Bytes>) -> Result<()> {
        let size: usize = chunks.iter().map(|c| c.len()).sum();
        if size == 0 {
            return Ok(());
        }

        let mut chunks = Some(chunks);
        loop {
            if self.shared.cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            {
                let mut state = self.shared.state.lock();
                if state.read_closed {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link reader closed").into());
                }
                if state.write_closed {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link writer closed").into());
                }
                if state.buffered < self.shared.capacity {
                    if let Some(chunks) = chunks.take() {
                        state.chunks.extend(chunks.into_iter().filter(|c| !c.is_empty()));
                        state.buffered += size;
                    }
                    drop(state);
                    self.shared.readable.notify_one();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = self.shared.cancel.cancelled() => return Err(DispatchError::Cancelled),
                _ = self.shared.writable.notified() => {}
            }
        }
    }

    /// 关闭写端（读端在读完剩余数据后得到 EOF），可重复调用
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if !state.write_closed {
            state.write_closed = true;
            drop(state);
            self.shared.readable.notify_one();
        }
    }

    /// 中断整条管道：两端的挂起操作都返回取消错误
    pub fn interrupt(&self) {
        self.shared.cancel.cancel();
    }

}

impl Drop for LinkWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// 管道读端
#[derive(Debug)]
pub struct LinkReader {
    shared: Arc<PipeShared>,
}

impl LinkReader {
    /// 读出当前缓冲的全部分块；`Ok(None)` 表示写端已关闭且数据已读完
    pub async fn read(&self) -> Result<Option<Vec<Bytes>>> {
        loop {
            if self.shared.cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            {
                let mut state = self.shared.state.lock();
                if !state.chunks.is_empty() {
                    let chunks: Vec<Bytes> = state.chunks.drain(..).collect();
                    state.buffered = 0;
                    drop(state);
                    self.shared.writable.notify_one();
                    return Ok(Some(chunks));
                }
                if state.write_closed {
                    return Ok(None);
                }
            }

            tokio::select! {
                _ = self.shared.cancel.cancelled() => return Err(DispatchError::Cancelled),
                _ = self.shared.readable.notified() => {}
            }
        }
    }

    /// 非阻塞、非消费地复制缓冲区前缀，返回复制的字节数
    pub fn peek(&self, buf: &mut [u8]) -> usize {
        let state = self.shared.state.lock();
        let mut copied = 0;
        for chunk in &state.chunks {
            if copied == buf.len() {
                break;
            }
            let n = chunk.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&chunk[..n]);
            copied += n;
        }
        copied
    }

    /// 当前缓冲的字节数
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buffered
    }

    /// 关闭读端，之后的写入返回 BrokenPipe，可重复调用
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if !state.read_closed {
            state.read_closed = true;
            state.chunks.clear();
            state.buffered = 0;
            drop(state);
            self.shared.writable.notify_one();
        }
    }

    /// 中断整条管道
    pub fn interrupt(&self) {
        self.shared.cancel.cancel();
    }

    pub async fn cancelled(&self) {
        self.shared.cancel.cancelled().await
    }
}

impl Drop for LinkReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// 链路的一侧：从 `reader` 读取对端写入的数据，向 `writer` 写入发往对端的数据
#[derive(Debug)]
pub struct Link {
    pub reader: LinkReader,
    pub writer: LinkWriter,
}

impl Link {
    /// 中断两个方向
    pub fn interrupt(&self) {
        self.reader.interrupt();
        self.writer.interrupt();
    }
}

/// 创建一对互相连接的链路：(入站侧, 出站侧)
///
/// 上行和下行管道各自使用 `cancel` 的子令牌，因此取消 `cancel`
/// 会同时中断两个方向，而中断其中一个方向不会影响另一个。
pub fn link_pair(capacity: usize, cancel: &CancellationToken) -> (Link, Link) {
    let (uplink_writer, uplink_reader) = pipe(capacity, cancel.child_token());
    let (downlink_writer, downlink_reader) = pipe(capacity, cancel.child_token());

    (
        Link {
            reader: downlink_reader,
            writer: uplink_writer,
        },
        Link {
            reader: uplink_reader,
            writer: downlink_writer,
        },
    )
}

/// 从异步读取源复制数据到链路写端，读到 EOF 后关闭写端
///
/// 管道被中断时即使源上没有数据也立即返回 `DispatchError::Cancelled`。
pub async fn copy_to_link<R>(reader: &mut R, writer: &LinkWriter) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut total = 0u64;
    let mut buf = BytesMut::with_capacity(PUMP_BUFFER_SIZE);

    loop {
        buf.reserve(PUMP_BUFFER_SIZE);
        let n = tokio::select! {
            _ = writer.shared.cancel.cancelled() => return Err(DispatchError::Cancelled),
            r = reader.read_buf(&mut buf) => r?,
        };
        if n == 0 {
            break;
        }
        total += n as u64;
        writer.write(buf.split().freeze()).await?;
    }

    writer.close();
    Ok(total)
}

/// 从链路读端复制数据到异步写入目标，EOF 后 shutdown 目标（半关闭）
pub async fn copy_from_link<W>(reader: &LinkReader, writer: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0u64;

    while let Some(chunks) = reader.read().await? {
        // 对端不读取时写入会一直挂起，中断必须能打断它
        tokio::select! {
            _ = reader.cancelled() => return Err(DispatchError::Cancelled),
            r = write_chunks(writer, &chunks) => r?,
        }
        total += chunks.iter().map(|c| c.len() as u64).sum::<u64>();
    }

    writer.shutdown().await?;
    Ok(total)
}

async fn write_chunks<W>(writer: &mut W, chunks: &[Bytes]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    for chunk in chunks {
        writer.write_all(chunk).await?;
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_pipe_preserves_order_and_length() {
        let (writer, reader) = pipe(1024, CancellationToken::new());

        let producer = tokio::spawn(async move {
            for i in 0..100u8 {
                let chunk = Bytes::from(vec![i; (i as usize % 7) + 1]);
                writer.write(chunk).await.unwrap();
            }
        });

        let mut received = Vec::new();
        while let Some(chunks) = reader.read().await.unwrap() {
            for c in chunks {
                received.extend_from_slice(&c);
            }
        }
        producer.await.unwrap();

        let mut expected = Vec::new();
        for i in 0..100u8 {
            expected.extend(std::iter::repeat(i).take((i as usize % 7) + 1));
        }
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_write_blocks_when_full() {
        let (writer, reader) = pipe(4, CancellationToken::new());
        writer.write(Bytes::from_static(b"abcd")).await.unwrap();

        // 缓冲已满，第二次写入应挂起
        let blocked = timeout(Duration::from_millis(50), writer.write(Bytes::from_static(b"e"))).await;
        assert!(blocked.is_err());

        let chunks = reader.read().await.unwrap().unwrap();
        assert_eq!(chunks.concat(), b"abcd");

        writer.write(Bytes::from_static(b"e")).await.unwrap();
        assert_eq!(reader.buffered(), 1);
    }

    #[tokio::test]
    async fn test_read_blocks_until_data() {
        let (writer, reader) = pipe(16, CancellationToken::new());
        let pending = timeout(Duration::from_millis(50), reader.read()).await;
        assert!(pending.is_err());

        writer.write(Bytes::from_static(b"x")).await.unwrap();
        let chunks = reader.read().await.unwrap().unwrap();
        assert_eq!(chunks.concat(), b"x");
    }

    #[tokio::test]
    async fn test_close_yields_eof_after_drain() {
        let (writer, reader) = pipe(16, CancellationToken::new());
        writer.write(Bytes::from_static(b"tail")).await.unwrap();
        drop(writer);

        assert_eq!(reader.read().await.unwrap().unwrap().concat(), b"tail");
        assert!(reader.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_after_reader_closed() {
        let (writer, reader) = pipe(16, CancellationToken::new());
        reader.close();
        let err = writer.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Io(_)));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_reader() {
        let cancel = CancellationToken::new();
        let (_writer, reader) = pipe(16, cancel.clone());

        let handle = tokio::spawn(async move { reader.read().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let (writer, reader) = pipe(64, CancellationToken::new());
        writer.write(Bytes::from_static(b"hello ")).await.unwrap();
        writer.write(Bytes::from_static(b"world")).await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(reader.peek(&mut buf), 8);
        assert_eq!(&buf, b"hello wo");
        assert_eq!(reader.buffered(), 11);
    }

    #[tokio::test]
    async fn test_link_pair_half_close() {
        let cancel = CancellationToken::new();
        let (inbound, outbound) = link_pair(1024, &cancel);

        inbound.writer.write(Bytes::from_static(b"ping")).await.unwrap();
        inbound.writer.close();

        assert_eq!(outbound.reader.read().await.unwrap().unwrap().concat(), b"ping");
        assert!(outbound.reader.read().await.unwrap().is_none());

        // 上行关闭后下行仍然可用
        outbound.writer.write(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(inbound.reader.read().await.unwrap().unwrap().concat(), b"pong");
    }

    #[tokio::test]
    async fn test_link_pair_parent_cancel_interrupts_both() {
        let cancel = CancellationToken::new();
        let (inbound, outbound) = link_pair(1024, &cancel);
        cancel.cancel();

        assert!(inbound.reader.read().await.unwrap_err().is_cancelled());
        assert!(outbound.reader.read().await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_copy_helpers() {
        let (writer, reader) = pipe(1024, CancellationToken::new());
        let mut source: &[u8] = b"stream payload";

        let copied = copy_to_link(&mut source, &writer).await.unwrap();
        assert_eq!(copied, 14);

        let mut sink = Vec::new();
        let written = copy_from_link(&reader, &mut sink).await.unwrap();
        assert_eq!(written, 14);
        assert_eq!(sink, b"stream payload");
    }

    #[tokio::test]
    async fn test_copy_to_link_stops_on_interrupt() {
        let cancel = CancellationToken::new();
        let (writer, _reader) = pipe(1024, cancel.clone());
        // 另一端保持打开但从不写入
        let (mut idle_source, _peer) = tokio::io::duplex(64);

        let handle = tokio::spawn(async move { copy_to_link(&mut idle_source, &writer).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_copy_from_link_stops_on_interrupt() {
        let cancel = CancellationToken::new();
        let (writer, reader) = pipe(1024, cancel.clone());
        writer.write(Bytes::from(vec![7u8; 256])).await.unwrap();
        // 目标缓冲很小且没有人读取，写入会挂起
        let (mut stalled_sink, _peer) = tokio::io::duplex(4);

        let handle = tokio::spawn(async move { copy_from_link(&reader, &mut stalled_sink).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }
}
