#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use boardlink::error::{BoardError, FileErrorKind};
    use boardlink::interface::mock::{MockDevice, MockLog};
    use boardlink::protocols::ascii_hex::{AsciiHexBoard, AsciiHexParams};
    use boardlink::{Board, BoardClass};

    const BANNER: &str =
        "\r\nWAKAYAMA.RB Board Ver.ARIDA5-1.52(2016/3/14)f3(256KB), mruby 1.2.0 (H [ENTER])\r\n>";

    /// A console with a flat file store
    #[derive(Default)]
    struct Console {
        files: BTreeMap<String, Vec<u8>>,
        /// Pending upload: path, expected hex characters, hex received so far
        upload: Option<(String, usize, String)>,
        line: String,
        /// Serve a payload shorter than the declared length
        corrupt_reads: bool,
    }

    impl Console {
        fn respond(&mut self, sent: &[u8]) -> Vec<u8> {
            let text = String::from_utf8_lossy(sent).into_owned();
            if let Some((path, expected, mut hex)) = self.upload.take() {
                hex.push_str(&text);
                if hex.len() < expected {
                    self.upload = Some((path, expected, hex));
                    return Vec::new();
                }
                let data = (0..hex.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
                    .collect();
                self.files.insert(path, data);
                return b"\r\nSaving\r\n....\r\n>".to_vec();
            }

            self.line.push_str(&text);
            let Some(line) = self.line.strip_suffix('\r').map(str::to_owned) else {
                return Vec::new();
            };
            self.line.clear();
            let args: Vec<&str> = line.split(' ').collect();
            let echo = format!("{}\r\n", line);

            let reply = match args.as_slice() {
                ["U", path, length] => {
                    self.upload = Some((path.to_string(), length.parse().unwrap(), String::new()));
                    return format!("{}Waiting\r\n", echo).into_bytes();
                }
                ["F", path] => match self.files.get(*path) {
                    Some(data) => {
                        let mut hex: String = data.iter().map(|b| format!("{:02X}", b)).collect();
                        if self.corrupt_reads {
                            hex.truncate(hex.len() - 2);
                        }
                        format!("{}\r\nWaiting\r\n{}{}", data.len(), hex, BANNER)
                    }
                    None => "File not found\r\n>".to_string(),
                },
                ["L"] => {
                    let mut listing = String::new();
                    for (name, data) in &self.files {
                        listing.push_str(&format!(" {} {} byte\r\n", name, data.len()));
                    }
                    format!("{}>", listing)
                }
                ["Z", path] => {
                    self.files.remove(*path);
                    ">".to_string()
                }
                ["R", _] => "Running\r\n".to_string(),
                _ => "?\r\n>".to_string(),
            };
            format!("{}{}", echo, reply).into_bytes()
        }
    }

    fn connect(console: Console) -> (AsciiHexBoard, Arc<Mutex<Console>>) {
        let (board, console, _log) = connect_logged(console);
        (board, console)
    }

    fn connect_logged(console: Console) -> (AsciiHexBoard, Arc<Mutex<Console>>, MockLog) {
        let console = Arc::new(Mutex::new(console));
        let responder = Arc::clone(&console);
        let device = MockDevice::new(move |sent| responder.lock().unwrap().respond(sent))
            .with_reset_reply(BANNER.as_bytes());
        let log = device.log();

        let mut board = AsciiHexBoard::with_params(
            BoardClass::WakayamaRb,
            AsciiHexParams {
                timeout: Duration::from_secs(2),
                save_timeout: Duration::from_secs(2),
                reset_settle: Duration::from_millis(500),
                ..Default::default()
            },
        );
        board.attach(Box::new(device), "mock").unwrap();
        (board, console, log)
    }

    #[test]
    fn listing_from_device_response() {
        let mut console = Console::default();
        console.files.insert("a.txt".into(), vec![0; 10]);
        console.files.insert("b.txt".into(), vec![0; 20]);
        let (mut board, _console) = connect(console);

        assert_eq!(board.enumerate_files("").unwrap(), ["a.txt", "b.txt"]);
    }

    #[test]
    fn upload_then_download() {
        let (mut board, console, log) = connect_logged(Console::default());
        board.write_file("main.mrb", b"RITE0003").unwrap();
        assert_eq!(console.lock().unwrap().files["main.mrb"], b"RITE0003");
        assert_eq!(log.resets(), 1);
        assert_eq!(log.sent_bytes(), b"U main.mrb 16\r5249544530303033");
        assert_eq!(board.read_file("main.mrb").unwrap(), b"RITE0003");
    }

    #[test]
    fn short_payload_fails_integrity_check() {
        let mut console = Console {
            corrupt_reads: true,
            ..Default::default()
        };
        console.files.insert("x.mrb".into(), vec![1, 2, 3]);
        let (mut board, _console) = connect(console);

        assert!(matches!(
            board.read_file("x.mrb"),
            Err(BoardError::Integrity(_))
        ));
    }

    #[test]
    fn unknown_file_is_not_found() {
        let (mut board, _console) = connect(Console::default());
        assert!(matches!(
            board.read_file("missing.mrb"),
            Err(BoardError::FileTransfer {
                kind: FileErrorKind::NotFound,
                ..
            })
        ));
    }

    #[test]
    fn remove_drops_the_file() {
        let mut console = Console::default();
        console.files.insert("old.mrb".into(), vec![7]);
        let (mut board, console) = connect(console);
        board.remove_file("old.mrb").unwrap();
        assert!(console.lock().unwrap().files.is_empty());
    }

    #[test]
    fn info_comes_from_banner() {
        let (mut board, _console) = connect(Console::default());
        let info = board.get_info().unwrap();
        assert_eq!(info.release.as_deref(), Some("ARIDA5-1.52(2016/3/14)f3(256KB)"));
        assert_eq!(info.path, "mock");
    }

    #[test]
    fn program_runs_until_stopped() {
        let (mut board, _console) = connect(Console::default());
        board.run_program("main.mrb").unwrap();
        assert!(board.is_running().unwrap());
        assert!(matches!(
            board.run_program("main.mrb"),
            Err(BoardError::Busy(_))
        ));
        board.stop_program().unwrap();
        assert!(!board.is_running().unwrap());
    }

    #[test]
    fn stop_resets_even_without_a_local_run() {
        let (mut board, _console, log) = connect_logged(Console::default());
        let events = board.events().subscribe();
        board.stop_program().unwrap();
        assert_eq!(log.resets(), 1);
        assert!(events.try_iter().next().is_none());
    }

    #[test]
    fn info_while_running_is_busy() {
        let (mut board, _console, log) = connect_logged(Console::default());
        board.run_program("main.mrb").unwrap();
        assert!(matches!(board.get_info(), Err(BoardError::Busy(_))));
        assert_eq!(log.resets(), 0);
        assert!(board.is_running().unwrap());
    }
}
