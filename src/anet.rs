//! Basic TCP socket stuff made a bit less boring.

use std::mem::{size_of, size_of_val, zeroed};
use std::net::Ipv4Addr;

use libc::{
    bind, c_void, close, fcntl, getsockname, listen, setsockopt, sockaddr, sockaddr_in, socket,
    AF_INET, EINTR, F_GETFL, F_SETFL, INADDR_ANY, IPPROTO_TCP, O_NONBLOCK, SOCK_STREAM,
    SOL_SOCKET, SO_KEEPALIVE, SO_REUSEADDR, TCP_NODELAY,
};

use crate::util::strerror;

pub fn tcp_server(port: u16, bindaddr: &str) -> Result<i32, String> {
    let mut sa: sockaddr_in;
    let on = 1;
    let sock;

    unsafe {
        sock = socket(AF_INET, SOCK_STREAM, 0);
        if sock == -1 {
            return Err(format!("socket: {}", strerror()));
        }
        if setsockopt(sock, SOL_SOCKET, SO_REUSEADDR, &on as *const _ as *const c_void, size_of::<i32>() as u32) == -1 {
            close(sock);
            return Err(format!("setsockopt SO_REUSEADDR: {}", strerror()));
        }
        sa = zeroed();
        #[cfg(target_os = "linux")]
        {
            sa.sin_family = AF_INET as u16;
        }
        #[cfg(target_os = "macos")]
        {
            sa.sin_family = AF_INET as u8;
        }
        sa.sin_port = port.to_be();     // Network byte order is big endian, or most significant byte first
        sa.sin_addr.s_addr = INADDR_ANY.to_be();
        if !bindaddr.is_empty() {
            match bindaddr.parse::<Ipv4Addr>() {
                Ok(addr) => {
                    sa.sin_addr.s_addr = u32::from(addr).to_be();
                }
                Err(e) => {
                    close(sock);
                    return Err(format!("Invalid bind address '{}': {}", bindaddr, e));
                }
            }
        }

        if bind(sock, &sa as *const _ as *const sockaddr, size_of::<sockaddr_in>() as u32) == -1 {
            close(sock);
            return Err(format!("bind: {}", strerror()));
        }

        if listen(sock, 511) == -1 {    // the magic 511 constant is from nginx
            close(sock);
            return Err(format!("listen: {}", strerror()));
        }
    }
    Ok(sock)
}

pub fn accept(serversock: i32) -> Result<(i32, u32, u16), String> {
    let mut sa: sockaddr_in;
    let fd;
    loop {
        unsafe {
            sa = zeroed();
            let mut len = size_of::<sockaddr_in>() as u32;
            let ret = libc::accept(serversock, &mut sa as *mut _ as *mut sockaddr, &mut len);
            if ret == -1 {
                if crate::util::error() == EINTR {
                    continue;
                }
                return Err(format!("accept: {}", strerror()));
            }
            fd = ret;
            break;
        }
    }

    let c_ip = u32::from_be(unsafe { sa.sin_addr.s_addr });
    let c_port = u16::from_be(sa.sin_port);
    Ok((fd, c_ip, c_port))
}

/// The locally bound address of a socket, mostly useful to discover the
/// port picked by the kernel after binding port 0.
pub fn sock_name(fd: i32) -> Result<(u32, u16), String> {
    let mut sa: sockaddr_in;
    unsafe {
        sa = zeroed();
        let mut len = size_of::<sockaddr_in>() as u32;
        if getsockname(fd, &mut sa as *mut _ as *mut sockaddr, &mut len) == -1 {
            return Err(format!("getsockname: {}", strerror()));
        }
    }
    Ok((u32::from_be(unsafe { sa.sin_addr.s_addr }), u16::from_be(sa.sin_port)))
}

pub fn nonblock(fd: i32) -> Result<(), String> {
    // Set the socket nonblocking.
    // Note that fcntl(2) for F_GETFL and F_SETFL can't be
    // interrupted by a signal.
    unsafe {
        let flag = fcntl(fd, F_GETFL);
        if flag == -1 {
            return Err(format!("fcntl(F_GETFL): {}", strerror()));
        }
        if fcntl(fd, F_SETFL, flag | O_NONBLOCK) == -1 {
            return Err(format!("fcntl(F_SETFL,O_NONBLOCK): {}", strerror()));
        }
    }
    Ok(())
}

pub fn tcp_no_delay(fd: i32) -> Result<(), String> {
    let yes = 1;
    unsafe {
        if setsockopt(fd, IPPROTO_TCP, TCP_NODELAY, &yes as *const _ as *const c_void, size_of_val(&yes) as u32) == -1 {
            return Err(format!("setsockopt TCP_NODELAY: {}", strerror()));
        }
    }
    Ok(())
}

pub fn tcp_keep_alive(fd: i32) -> Result<(), String> {
    let yes = 1;
    unsafe {
        if setsockopt(fd, SOL_SOCKET, SO_KEEPALIVE, &yes as *const _ as *const c_void, size_of_val(&yes) as u32) == -1 {
            return Err(format!("setsockopt SO_KEEPALIVE: {}", strerror()));
        }
    }
    Ok(())
}
