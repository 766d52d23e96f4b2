use std::process::exit;
use std::sync::Arc;

use rpusher::ae::EventLoop;
use rpusher::log::{log, LogLevel};
use rpusher::networking::handle_clients_with_pending_writes;
use rpusher::server::{Server, CONFIG_FDSET_INCR};

fn main() {
    let mut server = Server::new();

    let mut el: EventLoop<Server> = match EventLoop::create(server.maxclients + CONFIG_FDSET_INCR) {
        Ok(el) => el,
        Err(e) => {
            log(LogLevel::Warning, &format!("Failed creating the event loop. Error message: '{}'", e));
            exit(1);
        }
    };

    if let Err(e) = server.init_server(&mut el) {
        log(LogLevel::Warning, &e);
        exit(1);
    }

    log(LogLevel::Notice, &format!("The server is now ready to accept connections on port {} ({})",
        server.port, el.get_api_name()));

    // Flush whatever the handlers of this iteration produced before going
    // back to sleep; only leftovers get a writable registration.
    el.set_before_sleep_proc(Some(Arc::new(|el, srv| {
        handle_clients_with_pending_writes(el, srv);
    })));

    el.main(&mut server);

    server.shutdown();
    log(LogLevel::Notice, "Server shut down");
}
