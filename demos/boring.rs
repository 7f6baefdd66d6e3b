//! The classic CSP "boring generators" demo: two producers, a periodic
//! ticker and a one-shot deadline, fanned into a single `choose` loop.

use std::time::Duration;

use corio::{after, choose, every, if_can_pull, if_timer_fires, Channel, ChooseArm};

/// Spawn a generator that emits its label on a channel at a fixed cadence
/// until the channel is closed.
fn boring(label: &'static str, cadence: Duration) -> Channel<&'static str> {
    let messages = Channel::create(1);
    corio::start(move || {
        while messages.push(label) {
            corio::sleep(cadence);
        }
    });
    messages
}

fn main() {
    env_logger::init();

    corio::run(|| {
        let john = boring("john", Duration::from_millis(300));
        let peter = boring("peter", Duration::from_millis(500));
        let ticker = every(Duration::from_secs(1));
        let deadline = after(Duration::from_secs(3));

        loop {
            let mut hear_john = if_can_pull(john, |msg| println!("{}", msg));
            let mut hear_peter = if_can_pull(peter, |msg| println!("{}", msg));
            let mut tick = if_timer_fires(ticker, |_| println!("tick"));
            let mut done = if_timer_fires(deadline, |_| println!("time to leave"));
            match choose(&mut [
                &mut hear_john as &mut dyn ChooseArm,
                &mut hear_peter,
                &mut tick,
                &mut done,
            ]) {
                Some(3) | None => break,
                _ => {}
            }
        }

        john.close();
        peter.close();
        ticker.close();
    });
}
