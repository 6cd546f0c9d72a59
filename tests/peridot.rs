#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::io::{Read, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use boardlink::constants::SWI_BASE_ADDRESS;
    use boardlink::error::{BoardError, FileErrorKind};
    use boardlink::events::BoardEvent;
    use boardlink::interface::mock::MockBus;
    use boardlink::protocols::peridot::{PeridotBoard, PeridotParams};
    use boardlink::protocols::rpc::RpcMailbox;
    use boardlink::protocols::sector_diff::SectorDiffUpdater;
    use boardlink::{Board, FirmwareProgress};

    const MAILBOX: u32 = 0x0200_0000;

    fn reply(code: i32, data: &[u8]) -> Vec<u8> {
        let mut out = code.to_le_bytes().to_vec();
        out.extend_from_slice(data);
        out
    }

    fn word(bytes: &[u8]) -> u32 {
        u32::from_le_bytes(bytes[..4].try_into().unwrap())
    }

    /// The soft-core's virtual filesystem
    #[derive(Default)]
    struct Target {
        files: BTreeMap<String, Vec<u8>>,
        open: HashMap<u32, (String, usize)>,
        next_fd: u32,
        /// Bytes the running program prints, handed out one read at a time
        stdout: Vec<Vec<u8>>,
        stdin: Vec<u8>,
    }

    impl Target {
        fn handle(&mut self, request: &[u8]) -> Vec<u8> {
            let body = &request[1..];
            match request[0] {
                0x01 => {
                    let flags = word(body);
                    let path = String::from_utf8(body[4..].to_vec()).unwrap();
                    let creating = flags & 0x0200 != 0;
                    let special = path.starts_with("/dev/") || path.starts_with("/sys/");
                    if !creating && !special && !self.files.contains_key(&path) {
                        return reply(-2, &[]);
                    }
                    if flags & 0x0400 != 0 {
                        self.files.insert(path.clone(), Vec::new());
                    }
                    self.next_fd += 1;
                    self.open.insert(self.next_fd, (path, 0));
                    reply(self.next_fd as i32, &[])
                }
                0x02 => match self.open.remove(&word(body)) {
                    Some(_) => reply(0, &[]),
                    None => reply(-9, &[]),
                },
                0x03 => {
                    let fd = word(body);
                    let length = word(&body[4..]) as usize;
                    let (path, pos) = self.open[&fd].clone();
                    if path == "/dev/stdout" {
                        if self.stdout.is_empty() {
                            return reply(-11, &[]);
                        }
                        let chunk = self.stdout.remove(0);
                        return reply(chunk.len() as i32, &chunk);
                    }
                    let data = self.files.get(&path).cloned().unwrap_or_default();
                    let end = (pos + length).min(data.len());
                    self.open.insert(fd, (path, end));
                    reply((end - pos) as i32, &data[pos..end])
                }
                0x04 => {
                    let (path, _) = self.open[&word(body)].clone();
                    let data = &body[4..];
                    if path == "/dev/stdin" {
                        self.stdin.extend_from_slice(data);
                    } else {
                        let file = self.files.entry(path.clone()).or_default();
                        if path == "/sys/mruby/run" {
                            file.clear();
                        }
                        file.extend_from_slice(data);
                    }
                    reply(data.len() as i32, &[])
                }
                0x05 => {
                    let dir = String::from_utf8(body.to_vec()).unwrap();
                    let prefix = format!("{}/", dir.trim_end_matches('/'));
                    let names: Vec<&str> = self
                        .files
                        .keys()
                        .filter_map(|name| name.strip_prefix(prefix.as_str()))
                        .filter(|name| !name.contains('/'))
                        .collect();
                    reply(0, names.join("\n").as_bytes())
                }
                _ => reply(-38, &[]),
            }
        }
    }

    fn connect(target: Target) -> (PeridotBoard, Arc<Mutex<Target>>) {
        let target = Arc::new(Mutex::new(target));
        let handler = Arc::clone(&target);
        let bus = MockBus::new(SWI_BASE_ADDRESS, MAILBOX, move |request| {
            handler.lock().unwrap().handle(request)
        })
        .relocate_replies(0x0300_0000);

        let mut board = PeridotBoard::with_params(PeridotParams {
            run_poll: Duration::from_millis(10),
            ..Default::default()
        });
        board.attach_bus(Box::new(bus), "sim").unwrap();
        (board, target)
    }

    #[test]
    fn files_round_trip_through_rpc() {
        let (mut board, target) = connect(Target::default());
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        board.write_file("/app/main.mrb", &data).unwrap();
        assert_eq!(target.lock().unwrap().files["/app/main.mrb"], data);
        assert_eq!(board.read_file("/app/main.mrb").unwrap(), data);
        assert_eq!(board.enumerate_files("/app").unwrap(), ["main.mrb"]);

        // Every open was closed again
        assert!(target.lock().unwrap().open.is_empty());
    }

    #[test]
    fn missing_file_is_not_found() {
        let (mut board, _target) = connect(Target::default());
        assert!(matches!(
            board.read_file("/nope"),
            Err(BoardError::FileTransfer {
                kind: FileErrorKind::NotFound,
                ..
            })
        ));
    }

    #[test]
    fn info_from_sys_info() {
        let mut target = Target::default();
        target.files.insert(
            "/sys/info".into(),
            b"serial=PRD-0001\nrelease=1.0.2\nvariation=piccolo\n".to_vec(),
        );
        let (mut board, _target) = connect(target);
        let info = board.get_info().unwrap();
        assert_eq!(info.serial_number.as_deref(), Some("PRD-0001"));
        assert_eq!(info.variation.as_deref(), Some("piccolo"));
        assert_eq!(info.path, "sim");
    }

    #[test]
    fn program_end_is_reported_once() {
        let (mut board, target) = connect(Target::default());
        let events = board.events().subscribe();

        board.run_program("/app/main.mrb").unwrap();
        assert!(board.is_running().unwrap());
        assert_eq!(target.lock().unwrap().files["/sys/mruby/run"], b"/app/main.mrb");

        // The program finishes on its own
        target
            .lock()
            .unwrap()
            .files
            .insert("/sys/mruby/run".into(), Vec::new());
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            BoardEvent::Start
        );
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            BoardEvent::Stop
        );
        assert!(!board.is_running().unwrap());

        // Stopping an ended program does not repeat the event
        board.stop_program().unwrap();
        assert!(events.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn stop_program_clears_run_file() {
        let (mut board, target) = connect(Target::default());
        let events = board.events().subscribe();
        board.run_program("/app/loop.mrb").unwrap();
        board.stop_program().unwrap();

        assert_eq!(target.lock().unwrap().files["/sys/mruby/run"], b"\0");
        let seen: Vec<BoardEvent> = events.try_iter().collect();
        assert_eq!(seen, [BoardEvent::Start, BoardEvent::Stop]);
    }

    #[test]
    fn stdio_streams() {
        let target = Target {
            stdout: vec![b"hello ".to_vec(), b"world".to_vec()],
            ..Default::default()
        };
        let (board, target) = connect(target);

        let mut stdin = board.stdin().unwrap();
        stdin.write_all(b"input\n").unwrap();
        drop(stdin);
        assert_eq!(target.lock().unwrap().stdin, b"input\n");

        let mut stdout = board.stdout().unwrap();
        let mut buf = [0u8; 32];
        let first = stdout.read(&mut buf).unwrap();
        assert_eq!(&buf[..first], b"hello ");
        let second = stdout.read(&mut buf).unwrap();
        assert_eq!(&buf[..second], b"world");
    }

    #[test]
    fn empty_buffer_read_returns_immediately() {
        let target = Target {
            stdout: vec![b"queued".to_vec()],
            ..Default::default()
        };
        let (board, target) = connect(target);

        let mut stdout = board.stdout().unwrap();
        assert_eq!(stdout.read(&mut []).unwrap(), 0);
        // Nothing was consumed from the device
        assert_eq!(target.lock().unwrap().stdout.len(), 1);
    }

    #[test]
    fn matching_region_sends_no_write() {
        let image: Vec<u8> = (0..=255u8).collect();
        let table = {
            let mut body = 64u32.to_le_bytes().to_vec();
            body.extend_from_slice(&4u32.to_le_bytes());
            for chunk in image.chunks(64) {
                body.extend_from_slice(&md5::compute(chunk).0);
            }
            reply(0, &body)
        };
        let bus = MockBus::new(SWI_BASE_ADDRESS, MAILBOX, move |request| match request[0] {
            b'H' => table.clone(),
            _ => reply(-1, &[]),
        });
        let requests = bus.requests();
        let mut mailbox = RpcMailbox::new(Box::new(bus), SWI_BASE_ADDRESS);

        let mut progress: Vec<FirmwareProgress> = Vec::new();
        let summary = SectorDiffUpdater::new(&mut mailbox)
            .update("ufm", &image, &mut |p| progress.push(p))
            .unwrap();

        assert_eq!(summary.sectors_written, 0);
        assert_eq!(requests.lock().unwrap().len(), 1);
        assert_eq!(requests.lock().unwrap()[0], b"Hufm\0");
        assert_eq!(progress.len(), 1);
    }

    #[test]
    fn rejected_write_reports_address() {
        let bus = MockBus::new(SWI_BASE_ADDRESS, MAILBOX, |request| match request[0] {
            b'H' => {
                let mut body = 16u32.to_le_bytes().to_vec();
                body.extend_from_slice(&1u32.to_le_bytes());
                body.extend_from_slice(&[0u8; 16]);
                reply(0, &body)
            }
            _ => reply(-5, &0x0001_2000u32.to_le_bytes()),
        });
        let mut mailbox = RpcMailbox::new(Box::new(bus), SWI_BASE_ADDRESS);

        let err = SectorDiffUpdater::new(&mut mailbox)
            .update("cfm0", &[0xFF; 16], &mut |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            BoardError::Rejected {
                address: 0x0001_2000,
                code: -5
            }
        ));
    }
}
