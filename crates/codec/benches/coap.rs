use criterion::{Criterion, Throughput, criterion_group, criterion_main};

use coap_endpoint_codec::{BlockValue, Code, Message, MessageType};

fn criterion_benchmark(c: &mut Criterion) {
    let source = "127.0.0.1:5683".parse().unwrap();

    let mut request = Message::request(MessageType::Confirmable, Code::Get, source);
    request.mid = Some(0x1234);
    request.token = vec![0xDE, 0xAD, 0xBE, 0xEF];
    request.set_uri_path("sensors/temperature/celsius");
    request.set_uri_query("rt=temperature");
    request.set_observe(0);

    let mut response = Message::new();
    response.kind = Some(MessageType::Acknowledgement);
    response.code = Code::Content;
    response.destination = Some(source);
    response.mid = Some(0x1234);
    response.token = vec![0xDE, 0xAD, 0xBE, 0xEF];
    response.set_observe(2);
    response.set_block2(BlockValue::new(0, true, 1024).unwrap());
    response.set_max_age(60);
    response.payload = vec![0x55; 1024];

    let mut samples = [
        request.encode().unwrap().to_vec(),
        response.encode().unwrap().to_vec(),
    ]
    .into_iter()
    .cycle();

    let mut coap_criterion = c.benchmark_group("coap");

    coap_criterion.throughput(Throughput::Elements(1));
    coap_criterion.bench_function("decode", |bencher| {
        bencher.iter(|| {
            Message::decode(&samples.next().unwrap(), source).unwrap();
        })
    });

    coap_criterion.bench_function("encode", |bencher| {
        bencher.iter(|| {
            response.encode().unwrap();
        })
    });

    coap_criterion.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
