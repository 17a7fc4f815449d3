use super::build::TrackBuilder;
use super::components::EdgeDir;
use super::graph::Track;

/// Which physical table the control plane is driving.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Layout {
    TrackA,
    TrackB,
}

/// Builds the track graph for the selected table.
///
/// Both tables are a sensored main loop with a switched siding (turnout
/// 15) ending in a buffer, and a switched inner cut-off between turnouts
/// 9 and 10. Track B is the same topology on slightly different rail
/// lengths.
pub fn track(layout: Layout) -> Track {
    let stretch = |mm: i64| -> i64 {
        match layout {
            Layout::TrackA => mm,
            Layout::TrackB => mm + mm / 10,
        }
    };

    let mut b = TrackBuilder::new();

    // Main loop, forward direction: A1 C13 C14 (BR15) E7 (BR9) D5 (MR10) B4.
    let (a1, _a2) = b.sensor_pair("A1", "A2").expect("layout sensor");
    let (b4, _b5) = b.sensor_pair("B4", "B5").expect("layout sensor");
    let (c13, _c12) = b.sensor_pair("C13", "C12").expect("layout sensor");
    let (c14, _c15) = b.sensor_pair("C14", "C15").expect("layout sensor");
    let (e7, e8) = b.sensor_pair("E7", "E8").expect("layout sensor");
    let (d5, d6) = b.sensor_pair("D5", "D6").expect("layout sensor");

    // The siding behind turnout 15 and the cut-off between 9 and 10.
    let (e1, e2) = b.sensor_pair("E1", "E2").expect("layout sensor");
    let (c5, c6) = b.sensor_pair("C5", "C6").expect("layout sensor");

    let (br15, mr15) = b.switch(15);
    let (br9, mr9) = b.switch(9);
    let (br10, mr10) = b.switch(10);
    let (_en1, ex1) = b.gate("1");

    b.link(a1, c13, stretch(300));
    b.link(c13, c14, stretch(200));
    b.link(c14, br15, stretch(100));

    b.connect(br15, e7, stretch(200), EdgeDir::Straight);
    b.connect(e8, mr15, stretch(200), EdgeDir::Ahead);
    b.connect(br15, e1, stretch(150), EdgeDir::Curved);
    b.connect(e2, mr15, stretch(150), EdgeDir::Ahead);
    b.link(e1, ex1, stretch(100));

    b.link(e7, br9, stretch(200));
    b.connect(br9, d5, stretch(200), EdgeDir::Straight);
    b.connect(d6, mr9, stretch(200), EdgeDir::Ahead);
    b.connect(br9, c5, stretch(150), EdgeDir::Curved);
    b.connect(c6, mr9, stretch(150), EdgeDir::Ahead);

    b.connect(d5, mr10, stretch(100), EdgeDir::Ahead);
    b.connect(br10, d6, stretch(100), EdgeDir::Straight);
    b.connect(c5, mr10, stretch(100), EdgeDir::Ahead);
    b.connect(br10, c6, stretch(100), EdgeDir::Curved);

    b.link(mr10, b4, stretch(150));
    b.link(b4, a1, stretch(350));

    b.build().expect("layout is statically valid")
}
