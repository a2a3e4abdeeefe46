//! Polling backend for the event loop. Kept as a separate module from
//! `eventloop` so the polling primitive (epoll on Linux, kqueue as a
//! fallback) stays swappable without touching the dispatch loop itself.

pub mod io_event {
    #[cfg(target_os = "linux")]
    pub use linux::ApiState;
    #[cfg(target_os = "macos")]
    pub use macos::ApiState;

    #[cfg(target_os = "linux")]
    mod linux {
        use std::mem::zeroed;
        use libc::{close, epoll_create, epoll_ctl, epoll_event, epoll_wait, strerror, EPOLLIN, EPOLLOUT, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD};
        use crate::eventloop::{fired_write, Mask, SET_SIZE};
        use crate::util::error;

        pub struct ApiState {
            epfd: i32,
            events: [epoll_event; SET_SIZE],
        }

        impl ApiState {
            pub fn create() -> Result<ApiState, String> {
                let epfd = unsafe { epoll_create(1024) };  // size is only a kernel hint
                if epfd == -1 {
                    return Err(format!("epoll_create: {}", unsafe { *strerror(error()) }));
                }
                Ok(ApiState { epfd, events: [epoll_event { events: 0, u64: 0 }; SET_SIZE] })
            }

            /// `old` is the mask already registered for `fd`, if any; `mask` is
            /// the mask being added. We always hand epoll the union.
            pub fn add_event(&self, fd: i32, old: Mask, mask: Mask) -> Result<(), String> {
                let op = if old == Mask::None { EPOLL_CTL_ADD } else { EPOLL_CTL_MOD };
                let union = old | mask;
                let mut ee: epoll_event = unsafe { zeroed() };
                if union.is_readable() {
                    ee.events |= EPOLLIN as u32;
                }
                if union.is_writable() {
                    ee.events |= EPOLLOUT as u32;
                }
                ee.u64 = fd as u64;
                if unsafe { epoll_ctl(self.epfd, op, fd, &mut ee) } == -1 {
                    return Err(format!("epoll_ctl(ADD/MOD): {}", unsafe { *strerror(error()) }));
                }
                Ok(())
            }

            pub fn del_event(&self, fd: i32, mut old: Mask, mask: Mask) -> Result<(), String> {
                old.disable(mask);
                let mut ee: epoll_event = unsafe { zeroed() };
                if old.is_readable() {
                    ee.events |= EPOLLIN as u32;
                }
                if old.is_writable() {
                    ee.events |= EPOLLOUT as u32;
                }
                ee.u64 = fd as u64;
                let op = if old == Mask::None { EPOLL_CTL_DEL } else { EPOLL_CTL_MOD };
                if unsafe { epoll_ctl(self.epfd, op, fd, &mut ee) } == -1 {
                    return Err(format!("epoll_ctl(DEL/MOD): {}", unsafe { *strerror(error()) }));
                }
                Ok(())
            }

            pub fn poll(&mut self, time_val_us: Option<u128>) -> i32 {
                let timeout_ms = match time_val_us {
                    Some(us) => (us / 1000) as i32,
                    None => -1,
                };
                let ret = unsafe { epoll_wait(self.epfd, &mut self.events[0], SET_SIZE as i32, timeout_ms) };
                if ret <= 0 {
                    return 0;
                }
                let num_events = ret;
                for j in 0..num_events {
                    let mut mask = Mask::None;
                    let e = self.events[j as usize];
                    if (e.events & EPOLLIN as u32) != 0 {
                        mask = mask | Mask::Readable;
                    }
                    if (e.events & EPOLLOUT as u32) != 0 {
                        mask = mask | Mask::Writable;
                    }
                    fired_write()[j as usize].fd = e.u64 as i32;
                    fired_write()[j as usize].mask = mask;
                }
                num_events
            }

            pub fn name() -> String {
                "epoll".to_string()
            }
        }

        impl Drop for ApiState {
            fn drop(&mut self) {
                if unsafe { close(self.epfd) } == -1 {
                    eprintln!("ApiState::drop: close failed: {}", unsafe { *strerror(error()) });
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    mod macos {
        use std::ptr::{null, null_mut};
        use libc::{close, kevent, kqueue, strerror, timespec, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE};
        use crate::eventloop::{fired_write, Mask, SET_SIZE};
        use crate::util::error;

        #[derive(Clone, Copy)]
        struct Kevent {
            ident: i32,
            filter: i16,
            flags: u16,
            fflags: u32,
            data: isize,
        }

        pub struct ApiState {
            kqfd: i32,
            events: [Kevent; SET_SIZE],
        }

        impl ApiState {
            pub fn create() -> Result<ApiState, String> {
                let kqfd = unsafe { kqueue() };
                if kqfd == -1 {
                    return Err(format!("kqueue: {}", unsafe { *strerror(error()) }));
                }
                Ok(ApiState { kqfd, events: [Kevent { ident: 0, filter: 0, flags: 0, fflags: 0, data: 0 }; SET_SIZE] })
            }

            pub fn add_event(&self, fd: i32, _old: Mask, mask: Mask) -> Result<(), String> {
                let mut ke = kevent { ident: fd as usize, filter: EVFILT_READ, flags: EV_ADD, fflags: 0, data: 0, udata: null_mut() };
                if mask == Mask::Writable {
                    ke.filter = EVFILT_WRITE;
                }
                if mask == Mask::Readable || mask == Mask::Writable {
                    if unsafe { kevent(self.kqfd, &ke, 1, null_mut(), 0, null()) } == -1 {
                        return Err(format!("kevent(ADD): {}", unsafe { *strerror(error()) }));
                    }
                }
                Ok(())
            }

            pub fn del_event(&self, fd: i32, _old: Mask, mask: Mask) -> Result<(), String> {
                let mut ke = kevent { ident: fd as usize, filter: EVFILT_READ, flags: EV_DELETE, fflags: 0, data: 0, udata: null_mut() };
                if mask == Mask::Writable {
                    ke.filter = EVFILT_WRITE;
                }
                if mask == Mask::Readable || mask == Mask::Writable {
                    if unsafe { kevent(self.kqfd, &ke, 1, null_mut(), 0, null()) } == -1 {
                        return Err(format!("kevent(DELETE): {}", unsafe { *strerror(error()) }));
                    }
                }
                Ok(())
            }

            pub fn poll(&mut self, time_val_us: Option<u128>) -> i32 {
                let ret = match time_val_us {
                    Some(us) => {
                        let timeout = timespec { tv_sec: (us / 1_000_000) as i64, tv_nsec: ((us % 1_000_000) * 1000) as i64 };
                        unsafe { kevent(self.kqfd, null(), 0, &mut self.events[0] as *mut _ as *mut kevent, SET_SIZE as i32, &timeout) }
                    },
                    None => unsafe { kevent(self.kqfd, null(), 0, &mut self.events[0] as *mut _ as *mut kevent, SET_SIZE as i32, null()) },
                };
                if ret <= 0 {
                    return 0;
                }
                let num_events = ret;
                for j in 0..num_events {
                    let mut mask = Mask::None;
                    let e = &self.events[j as usize];
                    if e.filter == EVFILT_READ {
                        mask = mask | Mask::Readable;
                    }
                    if e.filter == EVFILT_WRITE {
                        mask = mask | Mask::Writable;
                    }
                    fired_write()[j as usize].fd = e.ident as i32;
                    fired_write()[j as usize].mask = mask;
                }
                num_events
            }

            pub fn name() -> String {
                "kqueue".to_string()
            }
        }

        impl Drop for ApiState {
            fn drop(&mut self) {
                if unsafe { close(self.kqfd) } == -1 {
                    eprintln!("ApiState::drop: close failed: {}", unsafe { *strerror(error()) });
                }
            }
        }
    }
}
