#![no_main]

use libfuzzer_sys::fuzz_target;
use tandem::controller::{NavTarget, PresentationController, Role};
use tandem::engine::DocumentRef;
use tandem::sync::{MessageBody, PeerId, SyncBus};

// Interleave local navigation with peer messages; the view must stay in range.
fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    let bus = SyncBus::new();
    let peer = bus.open("fuzz", PeerId::generate());
    let role = if data.first().is_some_and(|b| b & 1 == 1) {
        Role::Presenter
    } else {
        Role::Controller
    };
    let mut ctl = PresentationController::new(role, bus.open("fuzz", PeerId::generate()));
    ctl.load_document(DocumentRef::new("deck.typ"));
    ctl.on_document_loaded(u32::from(data.get(1).copied().unwrap_or(1)));

    for chunk in data.chunks(3).skip(1) {
        let [op, a, b] = [chunk[0], *chunk.get(1).unwrap_or(&0), *chunk.get(2).unwrap_or(&0)];
        let opt = |v: u8| (v != 0xff).then_some(u32::from(v));
        match op % 6 {
            0 => {
                let _ = ctl.navigate(NavTarget::Page(i64::from(a) - 128), None);
            }
            1 => {
                let _ = ctl.navigate(NavTarget::Delta(i64::from(a as i8)), None);
            }
            2 => peer.publish(MessageBody::PageUpdate {
                page: opt(a),
                total_pages: opt(b),
            }),
            3 => peer.publish(MessageBody::RequestState {}),
            4 => ctl.on_document_loaded(u32::from(a)),
            _ => {
                ctl.resume();
            }
        }
        ctl.pump();
        let view = ctl.view();
        assert!(view.total_pages >= 1);
        assert!((1..=view.total_pages).contains(&view.current_page), "{view}");
        let _ = ctl.take_events();
        peer.dispatch(|_| {});
    }
});
