mod applet;

pub use applet::Pythagora;
