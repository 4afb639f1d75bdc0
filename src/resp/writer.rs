//! RESP command serializer.
//!
//! Commands go on the wire as arrays of bulk strings:
//! `*<N>\r\n$<len>\r\narg1\r\n…`

use itoa::Buffer;

/// Encode one command into RESP wire format.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut cap = 13; // '*' + digits + CRLF
    for arg in args {
        cap += 13 + arg.len() + 2;
    }
    let mut buf = Vec::with_capacity(cap);
    write_command(&mut buf, args);
    buf
}

/// Encode one command from string arguments.
pub fn encode_command_str(args: &[&str]) -> Vec<u8> {
    let byte_args: Vec<&[u8]> = args.iter().map(|s| s.as_bytes()).collect();
    encode_command(&byte_args)
}

/// Encode a batch of commands into a single contiguous buffer so a per-node
/// pipeline goes out in one `write_all`.
pub fn encode_pipeline(commands: &[Vec<String>]) -> Vec<u8> {
    let mut cap = 0;
    for cmd_args in commands {
        cap += 13;
        for arg in cmd_args {
            cap += 13 + arg.len() + 2;
        }
    }
    let mut buf = Vec::with_capacity(cap);
    for cmd_args in commands {
        let byte_args: Vec<&[u8]> = cmd_args.iter().map(|s| s.as_bytes()).collect();
        write_command(&mut buf, &byte_args);
    }
    buf
}

fn write_command(buf: &mut Vec<u8>, args: &[&[u8]]) {
    let mut itoa_buf = Buffer::new();
    buf.push(b'*');
    buf.extend_from_slice(itoa_buf.format(args.len()).as_bytes());
    buf.extend_from_slice(b"\r\n");
    for arg in args {
        buf.push(b'$');
        buf.extend_from_slice(itoa_buf.format(arg.len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
}
